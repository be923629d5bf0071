// ── Read loops ──
//
// Infinite value streams built on `Session::read`. Disconnections and
// cancellations are swallowed: the loop parks until the peer is back and
// ends only when the session closes.

use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use tokio::time::MissedTickBehavior;

use crate::error::CoreError;
use crate::model::{Device, Trigger};
use crate::session::Session;

impl Session {
    /// Read `device` forever.
    ///
    /// Manual devices are read back to back, notifying devices yield each
    /// notified value. Errors other than disconnects are yielded and the
    /// loop carries on; the stream ends when the session closes.
    pub fn read_all(&self, device: &Device) -> impl Stream<Item = Result<Bytes, CoreError>> + Send + 'static {
        let session = self.clone();
        let device = device.clone();
        async_stream::stream! {
            if let Err(e) = session.device_state(&device) {
                yield Err(e);
                return;
            }
            while session.is_active() {
                match session.read(&device, None).await {
                    Ok(data) => yield Ok(data),
                    Err(e) if e.is_disconnect() => {
                        tracing::debug!(device = %device, error = %e, "read interrupted, waiting for connection");
                        if session.wait_connected(&device).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => yield Err(e),
                }
            }
            tracing::debug!(device = %device, "read loop finished");
        }
    }

    /// Stream values of `device` according to `trigger`.
    ///
    /// * `Manual`: same as [`read_all`](Self::read_all).
    /// * `OnChange`: values equal to the previous one are skipped. The
    ///   device must be notifying; for a manual device the stream yields
    ///   one [`CoreError::Configuration`] instead of polling BlueZ back to
    ///   back.
    /// * `Interval`: at most one value per period, the newest notified
    ///   one for notifying devices, otherwise a fresh read.
    ///
    /// The stream is lazy; dropping it and calling `notify` again starts
    /// over.
    pub fn notify(
        &self,
        device: &Device,
        trigger: Trigger,
    ) -> impl Stream<Item = Result<Bytes, CoreError>> + Send + 'static {
        match trigger {
            Trigger::Manual => self.read_all(device).boxed(),
            Trigger::OnChange if !device.trigger.is_notifying() => {
                let err = CoreError::Configuration {
                    message: format!("{device} has no notifications to watch for changes"),
                };
                futures_util::stream::once(std::future::ready(Err(err))).boxed()
            }
            Trigger::OnChange => on_change(self.read_all(device)).boxed(),
            Trigger::Interval(period) => self.interval(device.clone(), period).boxed(),
        }
    }

    fn interval(
        &self,
        device: Device,
        period: Duration,
    ) -> impl Stream<Item = Result<Bytes, CoreError>> + Send + 'static {
        let session = self.clone();
        async_stream::stream! {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<Bytes> = None;
            while session.is_active() {
                let cancel = session.inner.cancel.clone();
                let ticked = tokio::select! {
                    biased;
                    () = cancel.cancelled() => false,
                    _ = ticks.tick() => true,
                };
                if !ticked {
                    break;
                }

                let value = if device.trigger.is_notifying() {
                    match session.latest(&device).await {
                        Ok(Some(data)) => Ok(data),
                        Ok(None) => match &last {
                            Some(data) => Ok(data.clone()),
                            None => session.read(&device, None).await,
                        },
                        Err(e) => Err(e),
                    }
                } else {
                    session.read(&device, None).await
                };

                match value {
                    Ok(data) => {
                        last = Some(data.clone());
                        yield Ok(data);
                    }
                    Err(e) if e.is_disconnect() => {
                        tracing::debug!(device = %device, error = %e, "interval read interrupted, waiting for connection");
                        last = None;
                        if session.wait_connected(&device).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => yield Err(e),
                }
            }
        }
    }
}

/// Drop values equal to the previously yielded one. Errors pass through
/// and do not reset the comparison.
fn on_change<S>(values: S) -> impl Stream<Item = Result<Bytes, CoreError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, CoreError>> + Send + 'static,
{
    async_stream::stream! {
        let mut values = std::pin::pin!(values);
        let mut last: Option<Bytes> = None;
        while let Some(item) = values.next().await {
            match item {
                Ok(data) if last.as_ref() == Some(&data) => {}
                Ok(data) => {
                    last = Some(data.clone());
                    yield Ok(data);
                }
                Err(e) => yield Err(e),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[tokio::test]
    async fn on_change_skips_repeated_values() {
        let input = [1u8, 1, 2, 2, 3, 3, 1]
            .into_iter()
            .map(|b| Ok(Bytes::copy_from_slice(&[b])));
        let output: Vec<_> = on_change(stream::iter(input))
            .map(|r| r.unwrap()[0])
            .collect()
            .await;
        assert_eq!(output, vec![1, 2, 3, 1]);
    }

    #[tokio::test]
    async fn on_change_passes_errors_through() {
        let input = vec![
            Ok(Bytes::from_static(&[1])),
            Err(CoreError::Configuration { message: "x".into() }),
            Ok(Bytes::from_static(&[1])),
            Ok(Bytes::from_static(&[2])),
        ];
        let output: Vec<_> = on_change(stream::iter(input)).collect().await;
        assert_eq!(output.len(), 3);
        assert!(output[1].is_err());
        assert_eq!(output[2].as_ref().unwrap(), &Bytes::from_static(&[2]));
    }
}

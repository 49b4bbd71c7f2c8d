//! Per-call timeout around a blocking image source.
//!
//! Each call runs on its own thread; if it does not answer within the
//! deadline the caller gets `Unavailable` and the thread's late answer is
//! dropped.

use crossbeam_channel::{bounded, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{ImageSource, Pixels};
use crate::error::SourceError;
use crate::model::{ImageRef, PlateId, PlateMetadata, WellId};

pub struct TimedSource<S> {
    inner: Arc<S>,
    timeout: Duration,
}

impl<S: ImageSource + 'static> TimedSource<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(inner),
            timeout,
        }
    }

    fn call<T, F>(&self, what: String, f: F) -> Result<T, SourceError>
    where
        T: Send + 'static,
        F: FnOnce(&S) -> Result<T, SourceError> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("cellview-source".into())
            .spawn(move || {
                let _ = tx.send(f(&*inner));
            })
            .map_err(|e| SourceError::Unavailable(format!("cannot spawn source call: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(call = %what, timeout_ms = self.timeout.as_millis() as u64, "source call timed out");
                Err(SourceError::Unavailable(format!(
                    "{} timed out after {:?}",
                    what, self.timeout
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(SourceError::Unavailable(format!(
                "{} aborted",
                what
            ))),
        }
    }
}

impl<S: ImageSource + 'static> ImageSource for TimedSource<S> {
    fn fetch_plate(&self, plate_id: PlateId) -> Result<PlateMetadata, SourceError> {
        self.call(format!("fetch_plate({})", plate_id), move |s| {
            s.fetch_plate(plate_id)
        })
    }

    fn fetch_images(&self, well_id: WellId) -> Result<Vec<ImageRef>, SourceError> {
        self.call(format!("fetch_images({})", well_id), move |s| {
            s.fetch_images(well_id)
        })
    }

    fn fetch_pixels(&self, image: &ImageRef, channel: &str) -> Result<Pixels, SourceError> {
        let image = image.clone();
        let channel = channel.to_string();
        self.call(format!("fetch_pixels({}, {})", image.id, channel), move |s| {
            s.fetch_pixels(&image, &channel)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExperimentInfo;

    struct SlowSource(Duration);

    impl ImageSource for SlowSource {
        fn fetch_plate(&self, plate_id: PlateId) -> Result<PlateMetadata, SourceError> {
            thread::sleep(self.0);
            Ok(PlateMetadata {
                id: plate_id,
                name: "slow".into(),
                experiment: ExperimentInfo {
                    name: "e".into(),
                    owner: String::new(),
                },
                rows: 1,
                columns: 1,
                channels: vec![],
                wells: vec![],
            })
        }

        fn fetch_images(&self, well_id: WellId) -> Result<Vec<ImageRef>, SourceError> {
            Err(SourceError::NotFound(format!("well {}", well_id)))
        }

        fn fetch_pixels(&self, image: &ImageRef, _channel: &str) -> Result<Pixels, SourceError> {
            Err(SourceError::NotFound(format!("image {}", image.id)))
        }
    }

    #[test]
    fn timeout_is_retryable() {
        let source = TimedSource::new(SlowSource(Duration::from_millis(500)), Duration::from_millis(20));
        let err = source.fetch_plate(1).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn fast_calls_pass_through() {
        let source = TimedSource::new(SlowSource(Duration::ZERO), Duration::from_secs(5));
        assert_eq!(source.fetch_plate(3).unwrap().id, 3);
        assert!(matches!(source.fetch_images(4), Err(SourceError::NotFound(_))));
    }
}

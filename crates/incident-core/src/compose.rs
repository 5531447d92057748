use crate::encoder::EncodedPhoto;
use crate::error::AppendError;
use crate::ledger::SyncedLedger;
use crate::store::RemoteStore;
use crate::types::{Coordinate, Identity, IncidentRecord, NewIncident};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ComposeError {
    #[error("add a description")]
    MissingDescription,
    #[error("take a photo of the incident")]
    MissingPhoto,
    #[error("the photo could not be processed")]
    PhotoEncodingFailed,
    #[error("capture the location")]
    MissingLocation,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("a submission is already in progress")]
    Busy,
    #[error(transparent)]
    Invalid(#[from] ComposeError),
    #[error("failed to save incident: {0}")]
    Append(#[from] AppendError),
}

/// What the reporter has filled in so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComposeForm {
    pub description: String,
    pub photo: Option<EncodedPhoto>,
    pub coordinate: Option<Coordinate>,
}

impl ComposeForm {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_photo(mut self, photo: EncodedPhoto) -> Self {
        self.photo = Some(photo);
        self
    }

    pub fn with_coordinate(mut self, coordinate: Coordinate) -> Self {
        self.coordinate = Some(coordinate);
        self
    }

    /// Check the form in the order the reporter is prompted: description,
    /// photo, location.
    pub fn validate(&self) -> Result<(), ComposeError> {
        if self.description.is_empty() {
            return Err(ComposeError::MissingDescription);
        }
        match &self.photo {
            None => return Err(ComposeError::MissingPhoto),
            Some(photo) if photo.is_empty() => return Err(ComposeError::PhotoEncodingFailed),
            Some(_) => {}
        }
        if self.coordinate.is_none() {
            return Err(ComposeError::MissingLocation);
        }
        Ok(())
    }

    /// Build the incident to append. The form itself is left untouched so it
    /// can be resubmitted after a failure.
    pub fn to_incident(&self, reporter: &Identity) -> Result<NewIncident, ComposeError> {
        self.validate()?;
        Ok(NewIncident {
            description: self.description.clone(),
            encoded_photo: self
                .photo
                .as_ref()
                .map(|p| p.as_str().to_string())
                .unwrap_or_default(),
            coordinate: self.coordinate.unwrap_or_default(),
            reporter: reporter.clone(),
        })
    }
}

/// Busy flag guarding the submit action.
#[derive(Debug, Clone, Default)]
pub struct SubmitGuard {
    busy: Arc<AtomicBool>,
}

impl SubmitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard, or `None` if a submission is outstanding.
    pub fn try_begin(&self) -> Option<SubmitTicket> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SubmitTicket {
                busy: self.busy.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

/// Clears the busy flag when dropped.
#[derive(Debug)]
pub struct SubmitTicket {
    busy: Arc<AtomicBool>,
}

impl Drop for SubmitTicket {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// The submit action: validation, busy guard and append.
pub struct Submitter<S: RemoteStore + 'static> {
    ledger: SyncedLedger<S>,
    guard: SubmitGuard,
    reporter: Identity,
}

impl<S: RemoteStore + 'static> Submitter<S> {
    pub fn new(ledger: SyncedLedger<S>, reporter: Identity) -> Self {
        Self {
            ledger,
            guard: SubmitGuard::new(),
            reporter,
        }
    }

    pub fn guard(&self) -> &SubmitGuard {
        &self.guard
    }

    pub fn ledger(&self) -> &SyncedLedger<S> {
        &self.ledger
    }

    pub async fn submit(&self, form: &ComposeForm) -> Result<IncidentRecord, SubmitError> {
        let Some(_ticket) = self.guard.try_begin() else {
            debug!("Submit ignored, previous submission still in flight");
            return Err(SubmitError::Busy);
        };

        let incident = form.to_incident(&self.reporter)?;
        if incident.coordinate.is_null_island() {
            info!("Submitting incident at (0, 0); location may not have been captured");
        }

        Ok(self.ledger.append(incident).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::memory::MemoryStore;
    use crate::store::Listener;
    use crate::types::INCIDENTS_COLLECTION;
    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::Semaphore;

    fn photo() -> EncodedPhoto {
        crate::encoder::encode(&tiny_png())
    }

    fn tiny_png() -> Vec<u8> {
        use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
        let mut out = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn complete_form() -> ComposeForm {
        ComposeForm::new("Cable colgando")
            .with_photo(photo())
            .with_coordinate(Coordinate::new(4.6, -74.08))
    }

    /// Holds every write until a permit is released.
    struct GatedStore {
        inner: MemoryStore,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl RemoteStore for GatedStore {
        async fn allocate_key(&self, collection: &str) -> Result<String, StoreError> {
            self.inner.allocate_key(collection).await
        }

        async fn create_at(&self, collection: &str, key: &str, value: Value) -> Result<(), StoreError> {
            self.gate
                .acquire()
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))?
                .forget();
            self.inner.create_at(collection, key, value).await
        }

        async fn listen(&self, collection: &str) -> Result<Listener, StoreError> {
            self.inner.listen(collection).await
        }
    }

    #[test]
    fn test_validation_order() {
        assert_eq!(ComposeForm::default().validate(), Err(ComposeError::MissingDescription));
        assert_eq!(ComposeForm::new("x").validate(), Err(ComposeError::MissingPhoto));
        assert_eq!(
            ComposeForm::new("x").with_photo(EncodedPhoto::empty()).validate(),
            Err(ComposeError::PhotoEncodingFailed)
        );
        assert_eq!(
            ComposeForm::new("x").with_photo(photo()).validate(),
            Err(ComposeError::MissingLocation)
        );
        assert_eq!(complete_form().validate(), Ok(()));
    }

    #[test]
    fn test_zero_coordinate_is_accepted() {
        let form = ComposeForm::new("x")
            .with_photo(photo())
            .with_coordinate(Coordinate::new(0.0, 0.0));
        assert!(form.validate().is_ok());
    }

    #[test]
    fn test_guard_single_holder() {
        let guard = SubmitGuard::new();
        let ticket = guard.try_begin().unwrap();
        assert!(guard.is_busy());
        assert!(guard.try_begin().is_none());
        drop(ticket);
        assert!(!guard.is_busy());
        assert!(guard.try_begin().is_some());
    }

    #[tokio::test]
    async fn test_submit_copies_identity() {
        let store = Arc::new(MemoryStore::new());
        let submitter = Submitter::new(
            SyncedLedger::new(store.clone()),
            Identity::new("luis@example.com", "uid-luis"),
        );

        let record = submitter.submit(&complete_form()).await.unwrap();
        assert_eq!(record.reporter_email, "luis@example.com");
        assert_eq!(record.reporter_id, "uid-luis");
        assert_eq!(record.latitude, 4.6);
        assert!(!submitter.guard().is_busy());
        assert_eq!(store.len(INCIDENTS_COLLECTION).await, 1);
    }

    #[tokio::test]
    async fn test_invalid_form_does_not_write() {
        let store = Arc::new(MemoryStore::new());
        let submitter = Submitter::new(SyncedLedger::new(store.clone()), Identity::default());

        let err = submitter.submit(&ComposeForm::new("sin foto")).await.unwrap_err();
        assert!(matches!(err, SubmitError::Invalid(ComposeError::MissingPhoto)));
        assert!(!submitter.guard().is_busy());
        assert_eq!(store.len(INCIDENTS_COLLECTION).await, 0);
    }

    #[tokio::test]
    async fn test_second_submit_rejected_while_busy() {
        let gate = Arc::new(Semaphore::new(0));
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            gate: gate.clone(),
        });
        let submitter = Arc::new(Submitter::new(
            SyncedLedger::new(store.clone()),
            Identity::new("ana@example.com", "uid-ana"),
        ));

        let form = complete_form();
        let first = {
            let submitter = submitter.clone();
            let form = form.clone();
            tokio::spawn(async move { submitter.submit(&form).await })
        };

        while !submitter.guard().is_busy() {
            tokio::task::yield_now().await;
        }
        let second = submitter.submit(&form).await;
        assert!(matches!(second, Err(SubmitError::Busy)));

        gate.add_permits(1);
        first.await.unwrap().unwrap();
        assert!(!submitter.guard().is_busy());
        assert_eq!(store.inner.len(INCIDENTS_COLLECTION).await, 1);
    }

    #[tokio::test]
    async fn test_failed_submit_keeps_form_and_releases_guard() {
        let store = Arc::new(MemoryStore::new());
        store.faults().fail_next_writes(1);
        let submitter = Submitter::new(SyncedLedger::new(store.clone()), Identity::default());
        let form = complete_form();

        let err = submitter.submit(&form).await.unwrap_err();
        assert!(matches!(err, SubmitError::Append(AppendError::Store(_))));
        assert!(!submitter.guard().is_busy());
        assert_eq!(form, complete_form());

        submitter.submit(&form).await.unwrap();
        assert_eq!(store.len(INCIDENTS_COLLECTION).await, 1);
    }
}

//! Fluent construction of a [`ProcessorController`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::coordinator::{Coordinator, CoordinatorState};
use super::ProcessorController;
use crate::enumerator::PartitionEnumerator;
use crate::error::FeedError;
use crate::handler::ChangeHandler;
use crate::lease::{LeaseManager, LeaseRepository};
use crate::options::{ProcessorOptions, StartFrom};
use crate::source::ChangeFeedSource;

pub struct ProcessorBuilder {
    processor_name: String,
    source: Arc<dyn ChangeFeedSource>,
    handler: Arc<dyn ChangeHandler>,
    instance_name: Option<String>,
    lease_repository: Option<Arc<dyn LeaseRepository>>,
    start_from: StartFrom,
    options: ProcessorOptions,
}

impl ProcessorBuilder {
    pub fn new(
        processor_name: impl Into<String>,
        source: Arc<dyn ChangeFeedSource>,
        handler: Arc<dyn ChangeHandler>,
    ) -> Self {
        Self {
            processor_name: processor_name.into(),
            source,
            handler,
            instance_name: None,
            lease_repository: None,
            start_from: StartFrom::default(),
            options: ProcessorOptions::default(),
        }
    }

    /// Worker identity; defaults to a random uuid.
    pub fn with_instance_name(mut self, instance_name: impl Into<String>) -> Self {
        self.instance_name = Some(instance_name.into());
        self
    }

    pub fn with_lease_repository(mut self, repository: Arc<dyn LeaseRepository>) -> Self {
        self.lease_repository = Some(repository);
        self
    }

    /// Partitions without a checkpoint start at changes committed at or after `start_time`.
    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_from = StartFrom::Time(start_time);
        self
    }

    pub fn start_from(mut self, start_from: StartFrom) -> Self {
        self.start_from = start_from;
        self
    }

    pub fn with_options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<ProcessorController, FeedError> {
        if self.processor_name.trim().is_empty() {
            return Err(FeedError::Configuration(
                "processor name must not be empty".into(),
            ));
        }
        let instance_name = match self.instance_name {
            Some(name) if name.trim().is_empty() => {
                return Err(FeedError::Configuration(
                    "instance name must not be empty".into(),
                ))
            }
            Some(name) => name,
            None => uuid::Uuid::new_v4().to_string(),
        };
        let repository = self.lease_repository.ok_or_else(|| {
            FeedError::Configuration("a lease repository is required".into())
        })?;
        self.options.validate()?;
        let lease_ttl = self.options.lease_ttl_delta()?;

        let leases = Arc::new(LeaseManager::new(
            repository,
            self.processor_name.clone(),
            instance_name.clone(),
            lease_ttl,
            self.options.io_retry.clone(),
        ));
        let enumerator =
            PartitionEnumerator::new(self.source.clone(), self.options.io_retry.clone());
        let coordinator = Coordinator {
            processor_name: self.processor_name,
            instance_name,
            source: self.source,
            handler: self.handler,
            leases,
            enumerator,
            options: self.options,
            start_from: self.start_from,
            state: Mutex::new(CoordinatorState::default()),
        };
        Ok(ProcessorController::new(Arc::new(coordinator)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::handler::{handler_fn, HandlerError};
    use crate::lease::InMemoryLeaseRepository;
    use crate::source::InMemoryChangeFeed;

    fn builder() -> ProcessorBuilder {
        ProcessorBuilder::new(
            "carts",
            Arc::new(InMemoryChangeFeed::new(1)),
            Arc::new(handler_fn(|_ctx, _batch| async { Ok::<(), HandlerError>(()) })),
        )
    }

    #[test]
    fn lease_repository_is_required() {
        let err = builder().build().err().expect("missing repository");
        assert!(matches!(err, FeedError::Configuration(_)));
    }

    #[test]
    fn renew_interval_must_be_shorter_than_ttl() {
        let options = ProcessorOptions {
            lease_ttl: Duration::from_secs(10),
            renew_interval: Duration::from_secs(10),
            ..ProcessorOptions::default()
        };
        let err = builder()
            .with_lease_repository(Arc::new(InMemoryLeaseRepository::new()))
            .with_options(options)
            .build()
            .err()
            .expect("invalid options");
        assert!(matches!(err, FeedError::Configuration(_)));
    }

    #[test]
    fn instance_name_defaults_to_a_uuid() {
        let controller = builder()
            .with_lease_repository(Arc::new(InMemoryLeaseRepository::new()))
            .build()
            .expect("build");
        assert!(uuid::Uuid::parse_str(controller.instance_name()).is_ok());
        assert_eq!(controller.processor_name(), "carts");
    }

    #[test]
    fn blank_names_are_rejected() {
        let err = builder()
            .with_lease_repository(Arc::new(InMemoryLeaseRepository::new()))
            .with_instance_name("  ")
            .build()
            .err()
            .expect("blank instance");
        assert!(matches!(err, FeedError::Configuration(_)));
    }
}

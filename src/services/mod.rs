//! Business logic services

pub mod catalog;
pub mod circulation;
pub mod email;
pub mod locks;
pub mod members;
pub mod notifier;

use std::{sync::Arc, time::Duration};

use crate::{
    config::{CirculationConfig, EmailConfig},
    repository::Repository,
};

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub catalog: catalog::CatalogService,
    pub members: members::MembersService,
    pub circulation: circulation::CirculationService,
    pub repository: Repository,
}

impl Services {
    /// Create all services with the given repository
    pub fn new(
        repository: Repository,
        email_config: EmailConfig,
        circulation_config: &CirculationConfig,
    ) -> Self {
        let notifier: Arc<dyn notifier::Notifier> = if email_config.enabled {
            Arc::new(email::EmailService::new(email_config))
        } else {
            tracing::info!("Email delivery disabled, notifications will only be logged");
            Arc::new(notifier::LogNotifier)
        };

        Self::with_notifier(repository, notifier, circulation_config.lock_timeout())
    }

    /// Create all services around an explicit notifier
    pub fn with_notifier(
        repository: Repository,
        notifier: Arc<dyn notifier::Notifier>,
        lock_timeout: Duration,
    ) -> Self {
        // Catalog edits and circulation transactions share one lock per book
        let locks = locks::BookLocks::new(lock_timeout);

        Self {
            catalog: catalog::CatalogService::new(repository.clone(), locks.clone()),
            members: members::MembersService::new(repository.clone()),
            circulation: circulation::CirculationService::new(repository.clone(), locks, notifier),
            repository,
        }
    }
}

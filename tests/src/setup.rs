//! Common test setup functions.

use std::sync::Arc;

use engine_core::store::{EventStore, ProjectStore, UserStore};
use engine_core::{
    AttributionConfig, ChannelClassifier, JsonCodec, MergeConfig, PropertyCodec, RuleChannelClassifier, SessionConfig,
};
use worker::{
    DriverConfig, ProjectSessionizer, PropertyMerger, SchedulerConfig, SessionMaterializer, SessionScheduler,
    UserSessionizer,
};

use crate::mocks::MockStore;

/// Settings a test context is built from.
#[derive(Clone, Default)]
pub struct TestConfig {
    /// Replaces the default rule classifier when set
    pub classifier: Option<Arc<dyn ChannelClassifier>>,
    pub session: SessionConfig,
    pub attribution: AttributionConfig,
    pub merge: MergeConfig,
    pub driver: DriverConfig,
    pub scheduler: SchedulerConfig,
}

/// Test context wiring the production components over an in-memory store.
///
/// The worker code paths are the same as in the binary; only the store
/// behind the traits differs.
pub struct TestContext {
    pub store: Arc<MockStore>,
    pub materializer: Arc<SessionMaterializer>,
    pub merger: Arc<PropertyMerger>,
    pub users: Arc<UserSessionizer>,
    pub driver: Arc<ProjectSessionizer>,
    pub scheduler: Arc<SessionScheduler>,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(TestConfig::default())
    }

    pub fn with_config(config: TestConfig) -> Self {
        let store = Arc::new(MockStore::new());
        let events: Arc<dyn EventStore> = store.clone();
        let users: Arc<dyn UserStore> = store.clone();
        let projects: Arc<dyn ProjectStore> = store.clone();
        let codec: Arc<dyn PropertyCodec> = Arc::new(JsonCodec);
        let classifier: Arc<dyn ChannelClassifier> = match config.classifier {
            Some(classifier) => classifier,
            None => Arc::new(RuleChannelClassifier::default()),
        };

        let materializer = Arc::new(SessionMaterializer::new(
            events.clone(),
            classifier,
            codec.clone(),
            config.session,
        ));
        let merger = Arc::new(PropertyMerger::new(users, codec.clone(), config.merge));
        let user_sessionizer = Arc::new(UserSessionizer::new(
            events.clone(),
            materializer.clone(),
            merger.clone(),
            codec,
            config.attribution,
        ));
        let driver = Arc::new(ProjectSessionizer::new(
            events,
            projects.clone(),
            user_sessionizer.clone(),
            config.driver,
        ));
        let scheduler = Arc::new(SessionScheduler::new(config.scheduler, projects, driver.clone()));

        Self {
            store,
            materializer,
            merger,
            users: user_sessionizer,
            driver,
            scheduler,
        }
    }

    /// Context whose attribution only looks at the `utm` field.
    pub fn with_attribution_fields(fields: &[&str]) -> Self {
        Self::with_config(TestConfig {
            attribution: AttributionConfig::default().with_fields(fields.iter().copied()),
            ..Default::default()
        })
    }

    /// Set the store to fail (for error testing).
    pub fn set_store_failure(&self, should_fail: bool) {
        self.store.set_should_fail(should_fail);
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

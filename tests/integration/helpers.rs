//! Shared fixture: an engine wired to scripted doubles and a manual clock.

use std::sync::Arc;

use wpheal::clock::ManualClock;
use wpheal::config::Config;
use wpheal::engine::{Collaborators, Engine};
use wpheal::healing::DiagnoseOptions;
use wpheal::model::{Execution, HealingConfig, Target, TriggerSource};
use wpheal::testing::{MockBackupService, MockExecutor, MockProber, MockStore};

pub const SITE: &str = "shop";
pub const DOMAIN: &str = "shop.example.com";
pub const PATH: &str = "/var/www/shop";
pub const BROKEN_PLUGIN: &str = "broken-plugin";

/// Two untimestamped fatals from the same plugin file.
pub fn plugin_fatal_log() -> String {
    let line = format!(
        "PHP Fatal error:  Uncaught Error: Call to undefined function wc_get() in {}/wp-content/plugins/{}/includes/init.php:42",
        PATH, BROKEN_PLUGIN
    );
    format!("{}\n{}\n", line, line)
}

pub fn healthy_page() -> String {
    format!(
        "<!DOCTYPE html><html><head><title>Shop</title></head><body>{}</body></html>",
        "<p>Welcome to the shop</p>".repeat(40)
    )
}

pub fn critical_error_page() -> String {
    "<html><body>There has been a critical error on this website.</body></html>".to_string()
}

pub struct Harness {
    pub engine: Engine,
    pub executor: Arc<MockExecutor>,
    pub prober: Arc<MockProber>,
    pub backups: Arc<MockBackupService>,
    pub store: Arc<MockStore>,
    pub clock: Arc<ManualClock>,
}

/// Healing config without cooldown so a test can diagnose back to back.
pub fn no_cooldown() -> HealingConfig {
    HealingConfig {
        cooldown_secs: 0,
        ..Default::default()
    }
}

/// A site whose `broken-plugin` crashes every page.
pub async fn broken_site(healing: HealingConfig) -> Harness {
    harness_with(healing, MockBackupService::new()).await
}

/// Remote host whose error log carries the plugin fatal.
pub fn broken_host() -> MockExecutor {
    MockExecutor::new()
        .on("tail -n", &plugin_fatal_log())
        .on("else echo absent", "absent")
}

pub async fn harness_with(healing: HealingConfig, backups: MockBackupService) -> Harness {
    harness_from(healing, broken_host(), backups).await
}

pub async fn harness_from(
    healing: HealingConfig,
    executor: MockExecutor,
    backups: MockBackupService,
) -> Harness {
    wpheal::observability::telemetry::init_test_tracing();

    let executor = Arc::new(executor);
    let prober = Arc::new(MockProber::new().respond(DOMAIN, 200, &critical_error_page()));
    let backups = Arc::new(backups);
    let store = Arc::new(MockStore::new());
    let clock = Arc::new(ManualClock::default());

    let engine = Engine::new(
        Config::default(),
        Collaborators {
            store: store.clone(),
            executor: executor.clone(),
            prober: prober.clone(),
            backups: Some(backups.clone()),
            clock: clock.clone(),
        },
    )
    .expect("engine");
    engine
        .add_target(Target::new(SITE, DOMAIN, PATH).with_healing(healing))
        .await
        .expect("add target");

    Harness {
        engine,
        executor,
        prober,
        backups,
        store,
        clock,
    }
}

impl Harness {
    /// Serve a healthy page from now on.
    pub fn site_recovers(&self) {
        self.prober.set_response(DOMAIN, 200, &healthy_page());
    }

    pub async fn diagnose(&self) -> Execution {
        self.engine
            .diagnose(SITE, TriggerSource::Manual, &DiagnoseOptions::default())
            .await
            .expect("diagnose")
    }

    /// Heal and run the job (and any retries) inline.
    pub async fn heal_now(&self, execution_id: &str) -> Execution {
        self.engine.heal(execution_id, None).await.expect("heal");
        self.engine.run_pending().await.expect("run jobs");
        self.execution(execution_id).await
    }

    pub async fn execution(&self, execution_id: &str) -> Execution {
        self.engine
            .orchestrator()
            .get_execution(execution_id)
            .await
            .expect("execution")
    }

    pub async fn target(&self) -> Target {
        self.engine.target(SITE).await.expect("target")
    }
}

//! Shared test harness for weft-pool integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use weft_core::{Error, PoolSettings, Result, ThreadContext};
use weft_lock::{InMemoryServiceRegistry, ServiceRegistry};
use weft_pool::{ConfigParams, Connector, ConnectorPool, ConnectorRegistry};

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("weft_pool=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Counters and failure switches shared by every mock handle
#[derive(Debug, Default)]
pub struct Tracker {
    pub created: AtomicUsize,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub polls: AtomicUsize,
    pub fail_attach: AtomicBool,
    pub fail_detach: AtomicBool,
    pub fail_poll: AtomicBool,
}

impl Tracker {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct MockConnector {
    tracker: Arc<Tracker>,
    config: Option<ConfigParams>,
    attached_to: Option<String>,
}

impl Connector for MockConnector {
    fn connect(&mut self, config: &ConfigParams) -> Result<()> {
        self.tracker.connects.fetch_add(1, Ordering::SeqCst);
        self.config = Some(config.clone());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.tracker.disconnects.fetch_add(1, Ordering::SeqCst);
        self.config = None;
        Ok(())
    }

    fn set_thread_context(&mut self, ctx: &ThreadContext) -> Result<()> {
        if self.tracker.fail_attach.load(Ordering::SeqCst) {
            return Err(Error::connector("mock", "attach refused"));
        }
        self.attached_to = Some(ctx.name().to_string());
        Ok(())
    }

    fn clear_thread_context(&mut self) -> Result<()> {
        if self.tracker.fail_detach.load(Ordering::SeqCst) {
            return Err(Error::connector("mock", "detach refused"));
        }
        self.attached_to = None;
        Ok(())
    }

    fn poll(&mut self) -> Result<()> {
        if self.tracker.fail_poll.load(Ordering::SeqCst) {
            return Err(Error::connector("mock", "poll failed"));
        }
        self.tracker.polls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn configuration(&self) -> Option<&ConfigParams> {
        self.config.as_ref()
    }
}

/// Connection names the validator currently accepts
#[derive(Debug, Default, Clone)]
pub struct ValidNames(Arc<Mutex<HashSet<String>>>);

impl ValidNames {
    pub fn with(names: &[&str]) -> Self {
        let valid = Self::default();
        for name in names {
            valid.0.lock().insert(name.to_string());
        }
        valid
    }

    pub fn remove(&self, name: &str) {
        self.0.lock().remove(name);
    }
}

pub struct Harness {
    pub pool: Arc<ConnectorPool>,
    pub registry: Arc<ConnectorRegistry>,
    pub services: Arc<InMemoryServiceRegistry>,
    pub tracker: Arc<Tracker>,
    pub valid: ValidNames,
}

/// Pool with the `mock` type installed and a validator backed by `valid`
pub fn harness(valid: ValidNames) -> Harness {
    init_test_logging();

    let tracker = Arc::new(Tracker::default());
    let registry = Arc::new(ConnectorRegistry::new());
    let factory_tracker = Arc::clone(&tracker);
    registry.register(
        "mock",
        Arc::new(move || -> Result<Box<dyn Connector>> {
            factory_tracker.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockConnector {
                tracker: Arc::clone(&factory_tracker),
                config: None,
                attached_to: None,
            }))
        }),
    );
    registry.register(
        "broken",
        Arc::new(|| -> Result<Box<dyn Connector>> {
            Err(Error::instantiation("broken", "constructor failed"))
        }),
    );

    let services = Arc::new(InMemoryServiceRegistry::new());
    let validator_names = valid.clone();
    let mut settings = PoolSettings::default()
        .with_service_type_prefix("_POOL_")
        .with_default_capacity(2);
    settings.wait_poll_interval_ms = 5;

    let pool = ConnectorPool::from_config(
        &settings,
        registry.clone(),
        services.clone() as Arc<dyn ServiceRegistry>,
        Arc::new(move |_: &ThreadContext, name: &str| -> Result<bool> {
            Ok(validator_names.0.lock().contains(name))
        }),
    )
    .unwrap();

    Harness {
        pool: Arc::new(pool),
        registry,
        services,
        tracker,
        valid,
    }
}

pub fn config(value: &str) -> ConfigParams {
    ConfigParams::new().with("endpoint", value)
}

pub const SHORT: Duration = Duration::from_millis(50);
pub const LONG: Duration = Duration::from_secs(5);

//! Component assembly passes: create, setup, teardown, and container
//! installation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use modulith::{
    created_service, make_container, Args, Component, ComponentConf, ComponentError, Controller,
    InstanceRegistry, Service, ServiceError, ServiceState, ServiceWaiter, SvcConf, CtrlConf,
    SyncServiceCore, TypeFactory, TypeKey,
};

#[derive(Clone)]
struct AppCfg {
    url: String,
}

struct CfgService {
    core: SyncServiceCore,
    teardowns: Arc<AtomicUsize>,
    fail_teardown: bool,
}

impl Service for CfgService {
    fn state(&self) -> ServiceState {
        self.core.state()
    }

    fn waiter(&self) -> ServiceWaiter {
        self.core.waiter()
    }

    fn setup(&self, _: &InstanceRegistry) -> Result<ServiceState, ServiceError> {
        self.core.setup_transition()
    }

    fn teardown(&self, _: &InstanceRegistry) -> Result<ServiceState, ServiceError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_teardown {
            return Err(ServiceError::Unexpected("teardown exploded".into()));
        }
        self.core.teardown_transition()
    }

    fn start(&self) {
        self.core.switch_started(true);
    }

    fn stop(&self) {
        self.core.switch_started(false);
    }
}

struct NoopCtrl;

impl Controller for NoopCtrl {}

fn cfg_service_conf(teardowns: Arc<AtomicUsize>, fail_teardown: bool) -> ComponentConf {
    ComponentConf::new()
        .service(SvcConf::new::<CfgService>().args(Args::new().set("url", "db://local".to_string())))
        .service_factory::<CfgService>(move |ctx| {
            // explicit arg first, container dependency as the fallback
            let url = ctx
                .arg::<String>("url")
                .or_else(|| ctx.dependency::<AppCfg>().map(|c| c.url.clone()))
                .ok_or_else(|| ServiceError::Deps("url missing".into()))?;
            assert_eq!(url, "db://local");
            Ok(created_service(Arc::new(CfgService {
                core: SyncServiceCore::new(),
                teardowns: teardowns.clone(),
                fail_teardown,
            })))
        })
        .controller(CtrlConf::new::<NoopCtrl>())
        .controller_factory::<NoopCtrl>(|_| Ok(Arc::new(NoopCtrl)))
}

#[test]
fn component_lifecycle_runs_all_passes() {
    let teardowns = Arc::new(AtomicUsize::new(0));
    let component = Component::new("cfg", "app.cfg", cfg_service_conf(teardowns.clone(), false));

    component.create().unwrap();
    component.setup().unwrap();

    let services = component.services();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].state(), ServiceState::Active { started: false });

    component.start();
    assert_eq!(services[0].state(), ServiceState::Active { started: true });
    component.stop();

    component.teardown().unwrap();
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    assert!(component.services().is_empty());
}

#[test]
fn missing_factory_is_a_create_error() {
    let conf = ComponentConf::new().service(SvcConf::new::<CfgService>());
    let component = Component::new("cfg", "app.cfg", conf);

    let err = component.create().unwrap_err();
    assert!(matches!(err, ComponentError::Service { .. }));
    assert!(err.to_string().contains("service factory not found"));
}

#[test]
fn container_dependencies_inject_into_factories() {
    let teardowns = Arc::new(AtomicUsize::new(0));
    // no explicit arg this time: the factory must fall back to the container
    let conf = ComponentConf::new()
        .service(SvcConf::new::<CfgService>())
        .service_factory::<CfgService>({
            let teardowns = teardowns.clone();
            move |ctx| {
                let cfg = ctx
                    .dependency::<AppCfg>()
                    .ok_or_else(|| ServiceError::Deps("no AppCfg bound".into()))?;
                assert_eq!(cfg.url, "db://container");
                Ok(created_service(Arc::new(CfgService {
                    core: SyncServiceCore::new(),
                    teardowns: teardowns.clone(),
                    fail_teardown: false,
                })))
            }
        });

    let component = Component::new("cfg", "app.cfg", conf);
    let container = make_container(Vec::new(), None);
    container.registry().add_factory(
        TypeKey::of::<AppCfg>(),
        TypeFactory::from_instance(AppCfg {
            url: "db://container".to_string(),
        }),
    );
    assert!(component.install_container(&container));

    component.create().unwrap();
    component.setup().unwrap();
    component.teardown().unwrap();
}

#[test]
fn teardown_reports_the_first_error_but_keeps_going() {
    let teardowns = Arc::new(AtomicUsize::new(0));
    let mut conf = cfg_service_conf(teardowns.clone(), true);
    // a second, healthy service behind the failing one
    struct Quiet {
        core: SyncServiceCore,
        teardowns: Arc<AtomicUsize>,
    }
    impl Service for Quiet {
        fn state(&self) -> ServiceState {
            self.core.state()
        }
        fn waiter(&self) -> ServiceWaiter {
            self.core.waiter()
        }
        fn setup(&self, _: &InstanceRegistry) -> Result<ServiceState, ServiceError> {
            self.core.setup_transition()
        }
        fn teardown(&self, _: &InstanceRegistry) -> Result<ServiceState, ServiceError> {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            self.core.teardown_transition()
        }
        fn start(&self) {
            self.core.switch_started(true);
        }
        fn stop(&self) {
            self.core.switch_started(false);
        }
    }
    conf = conf.service(SvcConf::new::<Quiet>()).service_factory::<Quiet>({
        let teardowns = teardowns.clone();
        move |_| {
            Ok(created_service(Arc::new(Quiet {
                core: SyncServiceCore::new(),
                teardowns: teardowns.clone(),
            })))
        }
    });

    let component = Component::new("cfg", "app.cfg", conf);
    component.create().unwrap();
    component.setup().unwrap();

    let err = component.teardown().unwrap_err();
    assert!(err.to_string().contains("teardown exploded"));
    // both services were still torn down
    assert_eq!(teardowns.load(Ordering::SeqCst), 2);
}

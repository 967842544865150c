//! End-to-end module wiring: a component providing transactional dict
//! contexts, a sibling consuming them through operators and exposing a
//! functional operator provider, and a parent module importing that
//! provider across the module boundary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use modulith::{
    created_service, Application, AnyOperator, AnyProvider, BorrowFlags, ComponentConf,
    ContextBuilder, Controller, CtrlConf, InstanceRegistry, Lifetime, MemberOutput, ModuleComponentConf,
    ModuleConf, MutCtxCallbacks, OperatorMember, OwnerCtxRefBox, ProvideMember, ScopedResource,
    Service, ServiceError, ServiceState, ServiceWaiter, SlotOperator, SvcConf, SyncContext,
    SyncMutContext, SyncServiceCore, TypeKey,
};

type DictResource = HashMap<String, i64>;
type DictResContext = SyncContext<DictResource>;
type MutDictResContext = SyncMutContext<DictResource>;

/// The functional surface exposed through a forward provider.
struct FunctionalOperator {
    ctx: DictResContext,
    mut_ctx: MutDictResContext,
}

impl FunctionalOperator {
    fn add_number(&self, value: i64) -> Result<(), String> {
        let guard = self.mut_ctx.enter();
        guard.value().insert("number".into(), value);
        guard.apply().map_err(|e| e.to_string())
    }

    fn get_number(&self) -> Result<i64, String> {
        let guard = self.ctx.enter();
        let value = guard.value().get("number").copied();
        value.ok_or_else(|| "Number is not initialized".to_string())
    }

    fn remove_number(&self) -> Result<bool, String> {
        let guard = self.mut_ctx.enter();
        let value = guard.value().remove("number");
        guard.apply().map_err(|e| e.to_string())?;
        value
            .map(|_| true)
            .ok_or_else(|| "Number is not initialized".to_string())
    }
}

/// Component A: owns the dict store and provides shared and mutable
/// contexts over it.
struct DictProviderService {
    core: SyncServiceCore,
    bx: Arc<OwnerCtxRefBox<DictResource, DictResource>>,
}

impl DictProviderService {
    fn new() -> Arc<Self> {
        let store: Arc<Mutex<DictResource>> = Arc::new(Mutex::new(DictResource::new()));

        let read = store.clone();
        let shared = ContextBuilder::new(move || read.lock().unwrap().clone());

        let read = store.clone();
        let write = store;
        let mutable = ContextBuilder::new(move || read.lock().unwrap().clone()).mut_callbacks(
            MutCtxCallbacks::new().on_apply(move |v: &DictResource| {
                let mut store = write.lock().unwrap();
                store.clear();
                store.extend(v.clone());
            }),
        );

        let bx = Arc::new(OwnerCtxRefBox::new(shared, mutable).with_flags(BorrowFlags {
            allow_borrow_when_acquired: true,
            allow_acq_when_borrowed: true,
            allow_multiple_acquisition: false,
        }));

        Arc::new(Self {
            core: SyncServiceCore::new(),
            bx,
        })
    }
}

impl Service for DictProviderService {
    fn state(&self) -> ServiceState {
        self.core.state()
    }

    fn waiter(&self) -> ServiceWaiter {
        self.core.waiter()
    }

    fn provide_members(self: Arc<Self>) -> Vec<ProvideMember> {
        let shared_bx = self.bx.clone();
        let mut_bx = self.bx.clone();
        vec![
            ProvideMember::new(
                TypeKey::shared::<DictResContext>(),
                Lifetime::Component,
                move |_| Ok(MemberOutput::Provider(AnyProvider::from_shared(shared_bx.clone()))),
            ),
            ProvideMember::new(
                TypeKey::mutable::<MutDictResContext>(),
                Lifetime::Component,
                move |_| Ok(MemberOutput::Provider(AnyProvider::from_mut(mut_bx.clone()))),
            ),
        ]
    }

    fn setup(&self, _: &InstanceRegistry) -> Result<ServiceState, ServiceError> {
        self.core.setup_transition()
    }

    fn teardown(&self, _: &InstanceRegistry) -> Result<ServiceState, ServiceError> {
        self.core.teardown_transition()
    }

    fn start(&self) {
        self.core.switch_started(true);
    }

    fn stop(&self) {
        self.core.switch_started(false);
    }
}

/// Component B's controller: consumes the dict contexts through operator
/// sinks.
struct FunctionalOperatorCtrl {
    ctx_slot: Arc<SlotOperator<DictResContext>>,
    mut_slot: Arc<SlotOperator<MutDictResContext>>,
}

impl Controller for FunctionalOperatorCtrl {
    fn operator_members(self: Arc<Self>) -> Vec<OperatorMember> {
        let ctx_slot = self.ctx_slot.clone();
        let mut_slot = self.mut_slot.clone();
        vec![
            OperatorMember::new(TypeKey::of::<DictResContext>(), move || {
                Ok(AnyOperator::new(
                    TypeKey::of::<DictResContext>(),
                    ctx_slot.clone(),
                ))
            }),
            OperatorMember::new(TypeKey::of::<MutDictResContext>(), move || {
                Ok(AnyOperator::new(
                    TypeKey::of::<MutDictResContext>(),
                    mut_slot.clone(),
                ))
            }),
        ]
    }
}

/// Component B's service: exposes the functional operator built from the
/// contexts the controller received.
struct FunctionalOperatorService {
    core: SyncServiceCore,
    ctx_slot: Arc<SlotOperator<DictResContext>>,
    mut_slot: Arc<SlotOperator<MutDictResContext>>,
}

impl Service for FunctionalOperatorService {
    fn state(&self) -> ServiceState {
        self.core.state()
    }

    fn waiter(&self) -> ServiceWaiter {
        self.core.waiter()
    }

    fn provide_members(self: Arc<Self>) -> Vec<ProvideMember> {
        let ctx_slot = self.ctx_slot.clone();
        let mut_slot = self.mut_slot.clone();
        vec![ProvideMember::new(
            TypeKey::forward::<FunctionalOperator>(),
            Lifetime::Component,
            move |_| {
                let ctx_slot = ctx_slot.clone();
                let mut_slot = mut_slot.clone();
                Ok(MemberOutput::Scoped(ScopedResource::new(
                    move || {
                        let ctx = ctx_slot.get()?;
                        let mut_ctx = mut_slot.get()?;
                        Some(FunctionalOperator { ctx, mut_ctx })
                    },
                    |_op| {},
                )))
            },
        )]
    }

    fn setup(&self, _: &InstanceRegistry) -> Result<ServiceState, ServiceError> {
        self.core.setup_transition()
    }

    fn teardown(&self, _: &InstanceRegistry) -> Result<ServiceState, ServiceError> {
        self.core.teardown_transition()
    }

    fn start(&self) {
        self.core.switch_started(true);
    }

    fn stop(&self) {
        self.core.switch_started(false);
    }
}

fn inner_module_conf() -> ModuleConf {
    let shared_key = TypeKey::shared::<DictResContext>();
    let mut_key = TypeKey::mutable::<MutDictResContext>();
    let forward_key = TypeKey::forward::<FunctionalOperator>();

    // slots shared between B's controller and service
    let ctx_slot: Arc<SlotOperator<DictResContext>> = Arc::new(SlotOperator::new());
    let mut_slot: Arc<SlotOperator<MutDictResContext>> = Arc::new(SlotOperator::new());

    let resources = ComponentConf::new()
        .service(
            SvcConf::new::<DictProviderService>()
                .provides(shared_key)
                .provides(mut_key),
        )
        .service_factory::<DictProviderService>(|_| Ok(created_service(DictProviderService::new())))
        .provider(shared_key)
        .provider(mut_key);

    let ctrl_ctx_slot = ctx_slot.clone();
    let ctrl_mut_slot = mut_slot.clone();
    let svc_ctx_slot = ctx_slot;
    let svc_mut_slot = mut_slot;
    let functional = ComponentConf::new()
        .controller(CtrlConf::new::<FunctionalOperatorCtrl>())
        .controller_factory::<FunctionalOperatorCtrl>(move |_| {
            Ok(Arc::new(FunctionalOperatorCtrl {
                ctx_slot: ctrl_ctx_slot.clone(),
                mut_slot: ctrl_mut_slot.clone(),
            }))
        })
        .service(SvcConf::new::<FunctionalOperatorService>().provides(forward_key))
        .service_factory::<FunctionalOperatorService>(move |_| {
            Ok(created_service(Arc::new(FunctionalOperatorService {
                core: SyncServiceCore::new(),
                ctx_slot: svc_ctx_slot.clone(),
                mut_slot: svc_mut_slot.clone(),
            })))
        })
        .operator(TypeKey::of::<DictResContext>())
        .operator(TypeKey::of::<MutDictResContext>())
        .provider(forward_key);

    ModuleConf::new()
        .provider(forward_key)
        .component("resources", resources)
        .component("functional", functional)
}

fn root_module_conf() -> ModuleConf {
    let forward_key = TypeKey::forward::<FunctionalOperator>();
    ModuleConf::new().provider(forward_key).module_component(
        "funcs",
        ModuleComponentConf::new(
            ComponentConf::new().provider(forward_key),
            inner_module_conf(),
        ),
    )
}

#[test]
fn module_wiring_exposes_the_functional_provider() {
    let app = Application::new("app");
    app.load(root_module_conf()).unwrap();
    app.setup().unwrap();

    let forward_key = TypeKey::forward::<FunctionalOperator>();
    let provider = app.get_provider(&forward_key).expect("provider exported");
    let forward = provider.as_forward::<FunctionalOperator>().unwrap();

    let op = forward.take().unwrap();
    op.add_number(123).unwrap();
    assert_eq!(op.get_number().unwrap(), 123);
    assert!(op.remove_number().unwrap());
    assert_eq!(
        op.get_number().unwrap_err(),
        "Number is not initialized".to_string()
    );
    forward.dispose(op);

    app.start().unwrap();
    app.stop().unwrap();
    app.teardown().unwrap();
    app.unload().unwrap();
}

#[test]
fn unsatisfied_provider_claims_fail_setup() {
    let missing = TypeKey::forward::<FunctionalOperator>();
    let sub = ModuleConf::new().provider_claim(missing);
    let conf = ModuleConf::new().module_component(
        "needy",
        ModuleComponentConf::new(ComponentConf::new(), sub),
    );

    let app = Application::new("app");
    app.load(conf).unwrap();
    let err = app.setup().unwrap_err();
    assert!(err.to_string().contains("no provider found"));
}

#[test]
fn services_run_until_stopped() {
    let app = Arc::new(Application::new("app"));
    app.load(root_module_conf()).unwrap();
    app.setup().unwrap();
    app.start().unwrap();

    // stopping from another thread releases the run loop
    let stopper = {
        let app = app.clone();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(150));
            app.stop().unwrap();
        })
    };
    app.run_sync().unwrap();
    stopper.join().unwrap();

    app.teardown().unwrap();
    app.unload().unwrap();
}

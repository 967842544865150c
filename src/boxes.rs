//! Provider implementations ("boxes") over the four ownership contracts.
//!
//! Ref boxes hand out copies of a factory-produced value under counter
//! rules; ctx boxes hand out freshly built scoped contexts instead of bare
//! values; forward boxes move a single value through; gen boxes adapt an
//! init/fini resource pair to any of the contracts.

use std::sync::{Arc, Mutex};

use crate::context::{ContextBuilder, SyncContext, SyncMutContext};
use crate::error::{BorrowError, BorrowMutError, FactoryError, ForwardError};
use crate::key::TypeKey;
use crate::operators::Operator;
use crate::providers::{
    BorrowFlags, FactoryProvider, ForwardProvider, MutProvider, SharedProvider,
};

fn short_name<T: 'static>() -> String {
    TypeKey::of::<T>().short_name().to_string()
}

#[derive(Debug, Default)]
struct Counters {
    shared: u32,
    acq: u32,
}

/// Paired borrow/acquire counters enforcing the mutual-exclusion table.
#[derive(Debug, Default)]
struct CounterCell {
    state: Mutex<Counters>,
}

impl CounterCell {
    /// Check and count a shared borrow. `held_mutably` names the type
    /// reported when the value is held mutably.
    fn begin_borrow(&self, flags: BorrowFlags, held_mutably: &str) -> Result<(), BorrowError> {
        let mut c = self.state.lock().unwrap();
        if !flags.allow_borrow_when_acquired && c.acq > 0 {
            return Err(BorrowError::BorrowedAsMutable(held_mutably.to_string()));
        }
        c.shared += 1;
        Ok(())
    }

    /// Check and count an exclusive acquisition. `name` is the mutable
    /// resource, `held_shared` the type reported when shared borrows are
    /// outstanding.
    fn begin_acquire(
        &self,
        flags: BorrowFlags,
        name: &str,
        held_shared: &str,
    ) -> Result<(), BorrowMutError> {
        let mut c = self.state.lock().unwrap();
        if !flags.allow_multiple_acquisition && c.acq > 0 {
            return Err(BorrowMutError::AlreadyBorrowed(name.to_string()));
        }
        if !flags.allow_acq_when_borrowed && c.shared > 0 {
            return Err(BorrowMutError::BorrowedAsImmutable(held_shared.to_string()));
        }
        c.acq += 1;
        Ok(())
    }

    fn end_borrow(&self) {
        let mut c = self.state.lock().unwrap();
        c.shared = c.shared.saturating_sub(1);
    }

    fn end_acquire(&self) {
        let mut c = self.state.lock().unwrap();
        c.acq = c.acq.saturating_sub(1);
    }

    #[cfg(test)]
    fn snapshot(&self) -> (u32, u32) {
        let c = self.state.lock().unwrap();
        (c.shared, c.acq)
    }
}

// ----- Ref boxes -----

type ValueFactory<T> = Box<dyn Fn() -> Option<T> + Send + Sync>;
type CopyMaker<T> = Box<dyn Fn(&T) -> T + Send + Sync>;

/// Shared provider over a factory-produced value; each borrow hands out a
/// copy.
///
/// # Examples
///
/// ```rust
/// use modulith::{SharedRefBox, SharedProvider};
///
/// let bx = SharedRefBox::new(|| Some(123));
/// let a = bx.borrow().unwrap();
/// let b = bx.borrow().unwrap();
/// assert_eq!((a, b), (123, 123));
/// bx.reclaim(a);
/// bx.reclaim(b);
/// ```
pub struct SharedRefBox<T> {
    factory: ValueFactory<T>,
    copy: CopyMaker<T>,
    flags: BorrowFlags,
    counters: CounterCell,
}

impl<T: Clone + Send + 'static> SharedRefBox<T> {
    pub fn new(factory: impl Fn() -> Option<T> + Send + Sync + 'static) -> Self {
        Self::with_copy_maker(factory, T::clone)
    }
}

impl<T: Send + 'static> SharedRefBox<T> {
    pub fn with_copy_maker(
        factory: impl Fn() -> Option<T> + Send + Sync + 'static,
        copy: impl Fn(&T) -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            factory: Box::new(factory),
            copy: Box::new(copy),
            flags: BorrowFlags::default(),
            counters: CounterCell::default(),
        }
    }

    pub fn with_flags(mut self, flags: BorrowFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl<T: Send + 'static> SharedProvider<T> for SharedRefBox<T> {
    fn borrow(&self) -> Result<T, BorrowError> {
        let value = (self.factory)().ok_or_else(|| BorrowError::Empty(short_name::<T>()))?;
        self.counters.begin_borrow(self.flags, &short_name::<T>())?;
        Ok((self.copy)(&value))
    }

    fn reclaim(&self, instance: T) {
        self.counters.end_borrow();
        drop(instance);
    }
}

/// Mutable provider over a factory-produced value.
pub struct MutRefBox<T> {
    factory: ValueFactory<T>,
    copy: CopyMaker<T>,
    flags: BorrowFlags,
    counters: CounterCell,
}

impl<T: Clone + Send + 'static> MutRefBox<T> {
    pub fn new(factory: impl Fn() -> Option<T> + Send + Sync + 'static) -> Self {
        Self::with_copy_maker(factory, T::clone)
    }
}

impl<T: Send + 'static> MutRefBox<T> {
    pub fn with_copy_maker(
        factory: impl Fn() -> Option<T> + Send + Sync + 'static,
        copy: impl Fn(&T) -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            factory: Box::new(factory),
            copy: Box::new(copy),
            flags: BorrowFlags::default(),
            counters: CounterCell::default(),
        }
    }

    pub fn with_flags(mut self, flags: BorrowFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl<T: Send + 'static> MutProvider<T> for MutRefBox<T> {
    fn acquire(&self) -> Result<T, BorrowMutError> {
        let value = (self.factory)().ok_or_else(|| BorrowMutError::Empty(short_name::<T>()))?;
        self.counters
            .begin_acquire(self.flags, &short_name::<T>(), &short_name::<T>())?;
        Ok((self.copy)(&value))
    }

    fn release(&self, instance: T) {
        self.counters.end_acquire();
        drop(instance);
    }
}

/// Owner box: shared and mutable access over one counter pair, mutually
/// exclusive between the two sides.
pub struct OwnerRefBox<TS, TM> {
    factory: ValueFactory<TS>,
    mut_factory: ValueFactory<TM>,
    copy: CopyMaker<TS>,
    mut_copy: CopyMaker<TM>,
    flags: BorrowFlags,
    counters: CounterCell,
}

impl<TS, TM> OwnerRefBox<TS, TM>
where
    TS: Clone + Send + 'static,
    TM: Clone + Send + 'static,
{
    pub fn new(
        factory: impl Fn() -> Option<TS> + Send + Sync + 'static,
        mut_factory: impl Fn() -> Option<TM> + Send + Sync + 'static,
    ) -> Self {
        Self::with_copy_makers(factory, mut_factory, TS::clone, TM::clone)
    }
}

impl<TS, TM> OwnerRefBox<TS, TM>
where
    TS: Send + 'static,
    TM: Send + 'static,
{
    pub fn with_copy_makers(
        factory: impl Fn() -> Option<TS> + Send + Sync + 'static,
        mut_factory: impl Fn() -> Option<TM> + Send + Sync + 'static,
        copy: impl Fn(&TS) -> TS + Send + Sync + 'static,
        mut_copy: impl Fn(&TM) -> TM + Send + Sync + 'static,
    ) -> Self {
        Self {
            factory: Box::new(factory),
            mut_factory: Box::new(mut_factory),
            copy: Box::new(copy),
            mut_copy: Box::new(mut_copy),
            flags: BorrowFlags::default(),
            counters: CounterCell::default(),
        }
    }

    pub fn with_flags(mut self, flags: BorrowFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl<TS, TM> SharedProvider<TS> for OwnerRefBox<TS, TM>
where
    TS: Send + 'static,
    TM: Send + 'static,
{
    fn borrow(&self) -> Result<TS, BorrowError> {
        let value = (self.factory)().ok_or_else(|| BorrowError::Empty(short_name::<TS>()))?;
        self.counters.begin_borrow(self.flags, &short_name::<TS>())?;
        Ok((self.copy)(&value))
    }

    fn reclaim(&self, instance: TS) {
        self.counters.end_borrow();
        drop(instance);
    }
}

impl<TS, TM> MutProvider<TM> for OwnerRefBox<TS, TM>
where
    TS: Send + 'static,
    TM: Send + 'static,
{
    fn acquire(&self) -> Result<TM, BorrowMutError> {
        let value = (self.mut_factory)().ok_or_else(|| BorrowMutError::Empty(short_name::<TM>()))?;
        self.counters
            .begin_acquire(self.flags, &short_name::<TM>(), &short_name::<TM>())?;
        Ok((self.mut_copy)(&value))
    }

    fn release(&self, instance: TM) {
        self.counters.end_acquire();
        drop(instance);
    }
}

// ----- Ctx boxes -----

/// Shared provider yielding a freshly built [`SyncContext`] per borrow.
pub struct SharedCtxRefBox<T> {
    builder: ContextBuilder<T>,
    flags: BorrowFlags,
    counters: CounterCell,
}

impl<T: Send + 'static> SharedCtxRefBox<T> {
    pub fn new(builder: ContextBuilder<T>) -> Self {
        Self {
            builder,
            flags: BorrowFlags::default(),
            counters: CounterCell::default(),
        }
    }

    pub fn with_flags(mut self, flags: BorrowFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl<T: Send + 'static> SharedProvider<SyncContext<T>> for SharedCtxRefBox<T> {
    fn borrow(&self) -> Result<SyncContext<T>, BorrowError> {
        self.counters.begin_borrow(self.flags, &short_name::<T>())?;
        Ok(self.builder.clone().build())
    }

    fn reclaim(&self, instance: SyncContext<T>) {
        self.counters.end_borrow();
        drop(instance);
    }
}

/// Mutable provider yielding a freshly built [`SyncMutContext`] per
/// acquisition.
pub struct MutCtxRefBox<T> {
    builder: ContextBuilder<T>,
    flags: BorrowFlags,
    counters: CounterCell,
}

impl<T: Send + 'static> MutCtxRefBox<T> {
    pub fn new(builder: ContextBuilder<T>) -> Self {
        Self {
            builder,
            flags: BorrowFlags::default(),
            counters: CounterCell::default(),
        }
    }

    pub fn with_flags(mut self, flags: BorrowFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl<T: Send + 'static> MutProvider<SyncMutContext<T>> for MutCtxRefBox<T> {
    fn acquire(&self) -> Result<SyncMutContext<T>, BorrowMutError> {
        self.counters
            .begin_acquire(self.flags, &short_name::<T>(), &short_name::<T>())?;
        Ok(self.builder.clone().build_mut())
    }

    fn release(&self, instance: SyncMutContext<T>) {
        self.counters.end_acquire();
        drop(instance);
    }
}

/// Owner ctx box: shared contexts and mutable contexts over one counter
/// pair.
///
/// The canonical transactional-resource shape: readers get plain contexts
/// over a copy of the state, writers get mutating contexts whose
/// `on_apply` publishes the change back.
pub struct OwnerCtxRefBox<TS, TM> {
    builder: ContextBuilder<TS>,
    mut_builder: ContextBuilder<TM>,
    flags: BorrowFlags,
    counters: CounterCell,
}

impl<TS, TM> OwnerCtxRefBox<TS, TM>
where
    TS: Send + 'static,
    TM: Send + 'static,
{
    pub fn new(builder: ContextBuilder<TS>, mut_builder: ContextBuilder<TM>) -> Self {
        Self {
            builder,
            mut_builder,
            flags: BorrowFlags::default(),
            counters: CounterCell::default(),
        }
    }

    pub fn with_flags(mut self, flags: BorrowFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl<TS, TM> SharedProvider<SyncContext<TS>> for OwnerCtxRefBox<TS, TM>
where
    TS: Send + 'static,
    TM: Send + 'static,
{
    fn borrow(&self) -> Result<SyncContext<TS>, BorrowError> {
        self.counters.begin_borrow(self.flags, &short_name::<TS>())?;
        Ok(self.builder.clone().build())
    }

    fn reclaim(&self, instance: SyncContext<TS>) {
        self.counters.end_borrow();
        drop(instance);
    }
}

impl<TS, TM> MutProvider<SyncMutContext<TM>> for OwnerCtxRefBox<TS, TM>
where
    TS: Send + 'static,
    TM: Send + 'static,
{
    fn acquire(&self) -> Result<SyncMutContext<TM>, BorrowMutError> {
        self.counters
            .begin_acquire(self.flags, &short_name::<TM>(), &short_name::<TM>())?;
        Ok(self.mut_builder.clone().build_mut())
    }

    fn release(&self, instance: SyncMutContext<TM>) {
        self.counters.end_acquire();
        drop(instance);
    }
}

// ----- Forward boxes -----

/// Move-once slot: an [`Operator`] on the producing side and a
/// [`ForwardProvider`] on the consuming side.
///
/// # Examples
///
/// ```rust
/// use modulith::{ForwardBox, ForwardProvider, Operator, ForwardError};
///
/// let bx = ForwardBox::new();
/// assert!(matches!(bx.take(), Err(ForwardError::Empty(_))));
/// assert!(bx.accept(123));
/// assert_eq!(bx.take().unwrap(), 123);
/// assert!(matches!(bx.take(), Err(ForwardError::Empty(_))));
/// ```
pub struct ForwardBox<T> {
    value: Mutex<Option<T>>,
}

impl<T> ForwardBox<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    pub fn with_value(value: T) -> Self {
        Self {
            value: Mutex::new(Some(value)),
        }
    }
}

impl<T> Default for ForwardBox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Operator<T> for ForwardBox<T> {
    fn accept(&self, instance: T) -> bool {
        let mut slot = self.value.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(instance);
        true
    }

    fn revoke(&self) -> Option<T> {
        self.value.lock().unwrap().take()
    }
}

impl<T: Send + 'static> ForwardProvider<T> for ForwardBox<T> {
    fn take(&self) -> Result<T, ForwardError> {
        self.value
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ForwardError::Empty(short_name::<T>()))
    }

    fn dispose(&self, instance: T) {
        drop(instance);
    }

    fn is_present(&self) -> bool {
        self.value.lock().unwrap().is_some()
    }
}

/// A forward box whose `take` does not consume: every taker gets a copy of
/// the held value.
pub struct PermanentForwardBox<T> {
    value: Mutex<Option<T>>,
}

impl<T> PermanentForwardBox<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    pub fn with_value(value: T) -> Self {
        Self {
            value: Mutex::new(Some(value)),
        }
    }
}

impl<T> Default for PermanentForwardBox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Operator<T> for PermanentForwardBox<T> {
    fn accept(&self, instance: T) -> bool {
        let mut slot = self.value.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(instance);
        true
    }

    fn revoke(&self) -> Option<T> {
        self.value.lock().unwrap().take()
    }
}

impl<T: Clone + Send + 'static> ForwardProvider<T> for PermanentForwardBox<T> {
    fn take(&self) -> Result<T, ForwardError> {
        self.value
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ForwardError::Empty(short_name::<T>()))
    }

    fn dispose(&self, instance: T) {
        drop(instance);
    }

    fn is_present(&self) -> bool {
        self.value.lock().unwrap().is_some()
    }
}

// ----- Gen boxes -----

type InitFn<T> = Box<dyn Fn() -> Option<T> + Send + Sync>;
type FiniFn<T> = Box<dyn Fn(T) + Send + Sync>;

/// Shared provider over an init/fini resource pair.
pub struct SharedGenBox<T> {
    init: InitFn<T>,
    fini: FiniFn<T>,
}

impl<T: Send + 'static> SharedGenBox<T> {
    pub fn new(
        init: impl Fn() -> Option<T> + Send + Sync + 'static,
        fini: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            init: Box::new(init),
            fini: Box::new(fini),
        }
    }
}

impl<T: Send + 'static> SharedProvider<T> for SharedGenBox<T> {
    fn borrow(&self) -> Result<T, BorrowError> {
        (self.init)().ok_or_else(|| BorrowError::InsufficientDeps(short_name::<T>()))
    }

    fn reclaim(&self, instance: T) {
        (self.fini)(instance);
    }
}

/// Mutable provider over an init/fini resource pair.
pub struct MutGenBox<T> {
    init: InitFn<T>,
    fini: FiniFn<T>,
}

impl<T: Send + 'static> MutGenBox<T> {
    pub fn new(
        init: impl Fn() -> Option<T> + Send + Sync + 'static,
        fini: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            init: Box::new(init),
            fini: Box::new(fini),
        }
    }
}

impl<T: Send + 'static> MutProvider<T> for MutGenBox<T> {
    fn acquire(&self) -> Result<T, BorrowMutError> {
        (self.init)().ok_or_else(|| BorrowMutError::InsufficientDeps(short_name::<T>()))
    }

    fn release(&self, instance: T) {
        (self.fini)(instance);
    }
}

/// Factory provider over an init/fini resource pair.
pub struct FactoryGenBox<T> {
    init: InitFn<T>,
    fini: FiniFn<T>,
}

impl<T: Send + 'static> FactoryGenBox<T> {
    pub fn new(
        init: impl Fn() -> Option<T> + Send + Sync + 'static,
        fini: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            init: Box::new(init),
            fini: Box::new(fini),
        }
    }
}

impl<T: Send + 'static> FactoryProvider<T> for FactoryGenBox<T> {
    fn create(&self) -> Result<T, FactoryError> {
        (self.init)().ok_or_else(|| FactoryError::InsufficientDeps(short_name::<T>()))
    }

    fn destroy(&self, instance: T) {
        (self.fini)(instance);
    }
}

/// Forward provider over an init/fini resource pair; produces exactly one
/// value over its lifetime.
pub struct ForwardGenBox<T> {
    init: InitFn<T>,
    fini: FiniFn<T>,
    moved_out: Mutex<bool>,
}

impl<T: Send + 'static> ForwardGenBox<T> {
    pub fn new(
        init: impl Fn() -> Option<T> + Send + Sync + 'static,
        fini: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            init: Box::new(init),
            fini: Box::new(fini),
            moved_out: Mutex::new(false),
        }
    }
}

impl<T: Send + 'static> ForwardProvider<T> for ForwardGenBox<T> {
    fn take(&self) -> Result<T, ForwardError> {
        let mut moved = self.moved_out.lock().unwrap();
        if *moved {
            return Err(ForwardError::MovedOut(short_name::<T>()));
        }
        let instance =
            (self.init)().ok_or_else(|| ForwardError::InsufficientDeps(short_name::<T>()))?;
        *moved = true;
        Ok(instance)
    }

    fn dispose(&self, instance: T) {
        if *self.moved_out.lock().unwrap() {
            (self.fini)(instance);
        }
    }

    fn is_present(&self) -> bool {
        !*self.moved_out.lock().unwrap()
    }
}

// Arc-ed boxes remain providers.
impl<T, P: SharedProvider<T>> SharedProvider<T> for Arc<P> {
    fn borrow(&self) -> Result<T, BorrowError> {
        (**self).borrow()
    }

    fn reclaim(&self, instance: T) {
        (**self).reclaim(instance)
    }
}

impl<T, P: MutProvider<T>> MutProvider<T> for Arc<P> {
    fn acquire(&self) -> Result<T, BorrowMutError> {
        (**self).acquire()
    }

    fn release(&self, instance: T) {
        (**self).release(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_box_counts_balanced() {
        let bx = SharedRefBox::new(|| Some(123));
        let a = bx.borrow().unwrap();
        let b = bx.borrow().unwrap();
        assert_eq!((a, b), (123, 123));
        bx.reclaim(a);
        bx.reclaim(b);
        assert_eq!(bx.counters.snapshot(), (0, 0));
    }

    #[test]
    fn mut_box_is_exclusive() {
        let bx = MutRefBox::new(|| Some(123));
        let first = bx.acquire().unwrap();
        assert_eq!(
            bx.acquire(),
            Err(BorrowMutError::AlreadyBorrowed("i32".into()))
        );
        bx.release(first);
        assert_eq!(bx.acquire().unwrap(), 123);
    }

    #[test]
    fn owner_box_mutual_exclusion() {
        let bx = OwnerRefBox::new(|| Some(123), || Some("123".to_string()));

        let a = bx.borrow().unwrap();
        let b = bx.borrow().unwrap();
        assert_eq!(a, 123);
        assert_eq!(
            bx.acquire(),
            Err(BorrowMutError::BorrowedAsImmutable("String".into()))
        );
        bx.reclaim(a);
        bx.reclaim(b);

        let m = bx.acquire().unwrap();
        assert_eq!(m, "123");
        assert_eq!(bx.borrow(), Err(BorrowError::BorrowedAsMutable("i32".into())));
        bx.release(m);
        assert_eq!(bx.borrow().unwrap(), 123);
    }

    #[test]
    fn empty_factory_reports_empty() {
        let bx = SharedRefBox::<i32>::new(|| None);
        assert_eq!(bx.borrow(), Err(BorrowError::Empty("i32".into())));
    }

    #[test]
    fn gen_boxes_run_fini_on_return() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let finis = Arc::new(AtomicUsize::new(0));

        let f = finis.clone();
        let shared = SharedGenBox::new(|| Some(1u8), move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let v = shared.borrow().unwrap();
        shared.reclaim(v);

        let f = finis.clone();
        let mutable = MutGenBox::new(|| Some(2u8), move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let v = mutable.acquire().unwrap();
        mutable.release(v);

        let f = finis.clone();
        let factory = FactoryGenBox::new(|| Some(3u8), move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let a = factory.create().unwrap();
        let b = factory.create().unwrap();
        factory.destroy(a);
        factory.destroy(b);

        assert_eq!(finis.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn gen_box_without_deps_reports_insufficient() {
        let bx = SharedGenBox::<u8>::new(|| None, |_| {});
        assert_eq!(bx.borrow(), Err(BorrowError::InsufficientDeps("u8".into())));
    }

    #[test]
    fn forward_gen_box_moves_once() {
        let bx = ForwardGenBox::new(|| Some(5u8), |_| {});
        assert!(bx.is_present());
        assert_eq!(bx.take().unwrap(), 5);
        assert_eq!(bx.take(), Err(ForwardError::MovedOut("u8".into())));
        assert!(!bx.is_present());
    }

    #[test]
    fn ctx_box_yields_working_context() {
        let bx = SharedCtxRefBox::new(ContextBuilder::new(|| 123));
        let ctx = bx.borrow().unwrap();
        {
            let guard = ctx.enter();
            assert_eq!(*guard.value(), 123);
        }
        bx.reclaim(ctx);
    }
}

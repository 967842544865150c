//! Resource lifetime definitions.

/// Lifetime rungs controlling when container-scoped resources are created
/// and destroyed.
///
/// Lifetimes form a totally ordered ladder from [`Lifetime::Root`] (the
/// whole process) down to [`Lifetime::Step`] (a single unit of work inside
/// an action). A container is bound to exactly one rung; descending the
/// ladder produces child containers bound to strictly deeper rungs.
///
/// Some rungs are *autocreated*: when a container descends without naming a
/// target, autocreated children are instantiated eagerly until the first
/// non-autocreate rung is reached. The others exist only on demand.
///
/// # Examples
///
/// ```rust
/// use modulith::Lifetime;
///
/// assert!(Lifetime::Root < Lifetime::Step);
/// assert!(Lifetime::Root.autocreate());
/// assert!(!Lifetime::Component.autocreate());
///
/// let ladder: Vec<_> = Lifetime::all().collect();
/// assert_eq!(ladder.first(), Some(&Lifetime::Root));
/// assert_eq!(ladder.last(), Some(&Lifetime::Step));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Lifetime {
    /// The whole process, outermost rung.
    Root,
    /// The runtime's event loop and worker thread.
    Runtime,
    /// A single assembled component.
    Component,
    /// A long-lived conversation (e.g. a connection).
    Session,
    /// One request within a session.
    Request,
    /// One action taken while serving a request.
    Action,
    /// One step of an action, innermost rung.
    Step,
}

impl Lifetime {
    /// Position of this rung on the ladder, `0` (Root) through `6` (Step).
    pub fn order(self) -> u8 {
        match self {
            Lifetime::Root => 0,
            Lifetime::Runtime => 1,
            Lifetime::Component => 2,
            Lifetime::Session => 3,
            Lifetime::Request => 4,
            Lifetime::Action => 5,
            Lifetime::Step => 6,
        }
    }

    /// Whether a descending container instantiates this rung eagerly.
    pub fn autocreate(self) -> bool {
        matches!(
            self,
            Lifetime::Root | Lifetime::Runtime | Lifetime::Session | Lifetime::Action
        )
    }

    /// The ladder in order, outermost first.
    pub fn all() -> impl Iterator<Item = Lifetime> {
        [
            Lifetime::Root,
            Lifetime::Runtime,
            Lifetime::Component,
            Lifetime::Session,
            Lifetime::Request,
            Lifetime::Action,
            Lifetime::Step,
        ]
        .into_iter()
    }

    /// Display name of the rung.
    pub fn name(self) -> &'static str {
        match self {
            Lifetime::Root => "ROOT",
            Lifetime::Runtime => "RUNTIME",
            Lifetime::Component => "COMPONENT",
            Lifetime::Session => "SESSION",
            Lifetime::Request => "REQUEST",
            Lifetime::Action => "ACTION",
            Lifetime::Step => "STEP",
        }
    }
}

impl std::fmt::Display for Lifetime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

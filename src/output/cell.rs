//! Single-assignment output cells with dependency tracking.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;

use crate::error::{Result, StackweaveError};

/// A reference to one output field of one resource, e.g. `apprepo.repositoryUrl`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    /// Logical name of the producing resource.
    pub resource: String,
    /// Output field on that resource.
    pub field: String,
}

/// Why an output cell could not produce a value.
///
/// The failure always names the resource at the root of the problem, so a
/// cell derived from a failed cell reports the original cause.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("resource '{resource}' failed: {message}")]
pub struct OutputFailure {
    /// Logical name of the root-cause resource.
    pub resource: String,
    /// Description of the failure.
    pub message: String,
}

/// Lifecycle of a cell.
#[derive(Debug, Clone)]
enum CellState<T> {
    Unresolved,
    Resolved(T),
    Failed(OutputFailure),
}

/// Outcome of checking the upstreams of a derived cell.
enum Readiness<U> {
    Pending,
    Ready(U),
    Failed(OutputFailure),
}

type Listener = Box<dyn FnOnce() + Send>;

struct Cell<T> {
    state: Mutex<CellState<T>>,
    listeners: Mutex<Vec<Listener>>,
    settled: watch::Sender<bool>,
    settling: Mutex<()>,
    refs: BTreeSet<OutputRef>,
    keys: Vec<Value>,
    derived: bool,
}

/// A lazily-resolved value of type `T`.
///
/// Cloning an `Output` clones the handle, not the value: every clone observes
/// the same resolution.
pub struct Output<T> {
    inner: Arc<Cell<T>>,
}

impl<T> Clone for Output<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl OutputRef {
    /// Creates a new output reference.
    #[must_use]
    pub fn new(resource: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.field)
    }
}

impl OutputFailure {
    /// Creates a new failure rooted at `resource`.
    #[must_use]
    pub fn new(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

impl<T> Cell<T> {
    fn new(state: CellState<T>, refs: BTreeSet<OutputRef>, keys: Vec<Value>, derived: bool) -> Self {
        let settled = !matches!(state, CellState::Unresolved);
        let (tx, _rx) = watch::channel(settled);
        Self {
            state: Mutex::new(state),
            listeners: Mutex::new(Vec::new()),
            settled: tx,
            settling: Mutex::new(()),
            refs,
            keys,
            derived,
        }
    }
}

impl<T> Output<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an unresolved root cell produced by a resource output.
    #[must_use]
    pub fn pending(source: OutputRef) -> Self {
        Self::from_cell(Cell::new(
            CellState::Unresolved,
            BTreeSet::from([source]),
            Vec::new(),
            false,
        ))
    }

    /// Creates a cell that is already resolved and depends on nothing.
    #[must_use]
    pub fn known(value: T) -> Self {
        Self::from_cell(Cell::new(CellState::Resolved(value), BTreeSet::new(), Vec::new(), false))
    }

    fn from_cell(cell: Cell<T>) -> Self {
        Self {
            inner: Arc::new(cell),
        }
    }

    /// The resource outputs this cell transitively derives from.
    #[must_use]
    pub fn refs(&self) -> &BTreeSet<OutputRef> {
        &self.inner.refs
    }

    /// Values attached with [`Output::keyed`], including those of upstream cells.
    #[must_use]
    pub fn keys(&self) -> &[Value] {
        &self.inner.keys
    }

    /// Logical names of the resources this cell depends on.
    #[must_use]
    pub fn resources(&self) -> BTreeSet<&str> {
        self.inner.refs.iter().map(|r| r.resource.as_str()).collect()
    }

    /// Resolves the cell with a value.
    ///
    /// # Errors
    ///
    /// Returns an internal consistency error if the cell was already settled
    /// or is derived from other cells.
    pub fn resolve(&self, value: T) -> Result<()> {
        self.settle_external(CellState::Resolved(value))
    }

    /// Fails the cell.
    ///
    /// # Errors
    ///
    /// Returns an internal consistency error if the cell was already settled
    /// or is derived from other cells.
    pub fn fail(&self, failure: OutputFailure) -> Result<()> {
        self.settle_external(CellState::Failed(failure))
    }

    fn settle_external(&self, next: CellState<T>) -> Result<()> {
        if self.inner.derived {
            return Err(StackweaveError::consistency(format!(
                "derived output {self:?} cannot be settled directly"
            )));
        }
        if self.settle(next) {
            Ok(())
        } else {
            Err(StackweaveError::consistency(format!(
                "output {self:?} was settled twice"
            )))
        }
    }

    /// Moves the cell to a terminal state. Returns false if it already was.
    fn settle(&self, next: CellState<T>) -> bool {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !matches!(*state, CellState::Unresolved) {
                return false;
            }
            *state = next;
        }

        let listeners = std::mem::take(
            &mut *self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        self.inner.settled.send_replace(true);
        for listener in listeners {
            listener();
        }
        true
    }

    /// Runs `listener` once this cell is settled (immediately if it already is).
    fn on_settle(&self, listener: Listener) {
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_settled() {
            drop(listeners);
            listener();
        } else {
            listeners.push(listener);
        }
    }

    /// Returns the outcome if the cell is settled, `None` otherwise.
    #[must_use]
    pub fn peek(&self) -> Option<std::result::Result<T, OutputFailure>> {
        let state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            CellState::Unresolved => None,
            CellState::Resolved(value) => Some(Ok(value.clone())),
            CellState::Failed(failure) => Some(Err(failure.clone())),
        }
    }

    /// Returns true once the cell is resolved or failed.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !matches!(
            *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner),
            CellState::Unresolved
        )
    }

    /// Waits until the cell is settled and returns its outcome.
    ///
    /// # Errors
    ///
    /// Returns the cell's failure if it (or any upstream) failed.
    pub async fn wait(&self) -> std::result::Result<T, OutputFailure> {
        let mut rx = self.inner.settled.subscribe();
        // The sender lives inside the cell we hold, so the channel cannot close.
        let _ = rx.wait_for(|settled| *settled).await;
        self.peek().unwrap_or_else(|| {
            Err(OutputFailure::new(
                "<engine>",
                "output signalled settlement without a value",
            ))
        })
    }

    /// Derives a new cell by applying `f` to this cell's value.
    #[must_use]
    pub fn apply<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let upstream = self.clone();
        Output::derive(self.refs().clone(), self.keys().to_vec(), &[self.as_settle()], move || {
            match upstream.peek() {
                None => Readiness::Pending,
                Some(Ok(value)) => Readiness::Ready(f(value)),
                Some(Err(failure)) => Readiness::Failed(failure),
            }
        })
    }

    /// Like [`Output::apply`], but the transform may reject the value.
    ///
    /// A rejection fails the derived cell, rooted at the first resource this
    /// cell depends on.
    #[must_use]
    pub fn try_apply<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> std::result::Result<U, String> + Send + Sync + 'static,
    {
        let upstream = self.clone();
        let root = self
            .refs()
            .iter()
            .next()
            .map_or_else(|| String::from("<transform>"), |r| r.resource.clone());
        Output::derive(self.refs().clone(), self.keys().to_vec(), &[self.as_settle()], move || {
            match upstream.peek() {
                None => Readiness::Pending,
                Some(Ok(value)) => match f(value) {
                    Ok(derived) => Readiness::Ready(derived),
                    Err(message) => Readiness::Failed(OutputFailure::new(root.clone(), message)),
                },
                Some(Err(failure)) => Readiness::Failed(failure),
            }
        })
    }

    /// Pairs this cell with another one.
    #[must_use]
    pub fn zip<U>(&self, other: &Output<U>) -> Output<(T, U)>
    where
        U: Clone + Send + Sync + 'static,
    {
        let left = self.clone();
        let right = other.clone();
        let refs = self.refs().union(other.refs()).cloned().collect();
        let keys = self.keys().iter().chain(other.keys()).cloned().collect();
        Output::derive(refs, keys, &[self.as_settle(), other.as_settle()], move || {
            match (left.peek(), right.peek()) {
                (Some(Err(failure)), _) | (_, Some(Err(failure))) => Readiness::Failed(failure),
                (Some(Ok(l)), Some(Ok(r))) => Readiness::Ready((l, r)),
                _ => Readiness::Pending,
            }
        })
    }

    /// Derives a cell from every cell in `cells`.
    ///
    /// The transform runs once, after all upstreams resolved, and receives
    /// their values in argument order. If any upstream fails the derived cell
    /// fails with the first failure in argument order, without waiting for
    /// the remaining upstreams.
    #[must_use]
    pub fn combine<U, F>(cells: &[Self], f: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(Vec<T>) -> U + Send + Sync + 'static,
    {
        let upstreams: Vec<Self> = cells.to_vec();
        let refs = cells.iter().flat_map(|c| c.refs().iter().cloned()).collect();
        let keys = cells.iter().flat_map(|c| c.keys().iter().cloned()).collect();
        let settles: Vec<Settle> = cells.iter().map(Self::as_settle).collect();
        Output::derive(refs, keys, &settles, move || {
            let outcomes: Vec<_> = upstreams.iter().map(Self::peek).collect();
            if let Some(failure) = outcomes.iter().find_map(|o| match o {
                Some(Err(failure)) => Some(failure.clone()),
                _ => None,
            }) {
                return Readiness::Failed(failure);
            }
            let values: Option<Vec<T>> = outcomes
                .into_iter()
                .map(|o| o.and_then(std::result::Result::ok))
                .collect();
            values.map_or(Readiness::Pending, |values| Readiness::Ready(f(values)))
        })
    }

    /// Collects every cell's value into a vector.
    #[must_use]
    pub fn all(cells: &[Self]) -> Output<Vec<T>> {
        Self::combine(cells, |values| values)
    }

    /// Attaches a value that shaped this cell's transform.
    ///
    /// Values captured inside a closure are invisible to planning, which
    /// only sees which outputs a cell derives from. Keying the cell with
    /// them puts them in the declared form of any input built from it, so
    /// changing them changes the plan.
    #[must_use]
    pub fn keyed(&self, key: impl Serialize) -> Self {
        let upstream = self.clone();
        let mut keys = self.keys().to_vec();
        keys.push(serde_json::to_value(key).unwrap_or_default());
        Self::derive(self.refs().clone(), keys, &[self.as_settle()], move || {
            match upstream.peek() {
                None => Readiness::Pending,
                Some(Ok(value)) => Readiness::Ready(value),
                Some(Err(failure)) => Readiness::Failed(failure),
            }
        })
    }

    fn as_settle(&self) -> Settle {
        let cell = self.clone();
        Box::new(move |listener| cell.on_settle(listener))
    }
}

type Settle = Box<dyn Fn(Listener) + Send + Sync>;

impl<U> Output<U>
where
    U: Clone + Send + Sync + 'static,
{
    fn derive<P>(refs: BTreeSet<OutputRef>, keys: Vec<Value>, upstreams: &[Settle], check: P) -> Self
    where
        P: Fn() -> Readiness<U> + Send + Sync + 'static,
    {
        let derived = Self::from_cell(Cell::new(CellState::Unresolved, refs, keys, true));
        let check = Arc::new(check);

        for register in upstreams {
            let target = derived.clone();
            let check = Arc::clone(&check);
            register(Box::new(move || target.try_settle(check.as_ref())));
        }
        derived.try_settle(check.as_ref());
        derived
    }

    /// Checks the upstreams and settles on a terminal outcome. Upstreams
    /// settling on different threads are serialized, so the transform runs
    /// at most once.
    fn try_settle(&self, check: &(dyn Fn() -> Readiness<U> + Send + Sync)) {
        let _settling = self.inner.settling.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_settled() {
            return;
        }
        match check() {
            Readiness::Pending => {}
            Readiness::Ready(value) => {
                self.settle(CellState::Resolved(value));
            }
            Readiness::Failed(failure) => {
                self.settle(CellState::Failed(failure));
            }
        }
    }
}

impl<T> fmt::Debug for Output<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) {
            CellState::Unresolved => "unresolved",
            CellState::Resolved(_) => "resolved",
            CellState::Failed(_) => "failed",
        };
        let refs: Vec<String> = self.inner.refs.iter().map(ToString::to_string).collect();
        write!(f, "Output({state}, [{}])", refs.join(", "))
    }
}

use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::executor::ExecutorHandle;

/// Identifier returned when registering a listener; pass it back to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Allocate the next id from `counter`.
    pub fn next(counter: &AtomicU64) -> Self {
        Self(counter.fetch_add(1, Ordering::Relaxed))
    }
}

/// Closed set of named boolean inputs.
pub trait ConjunctionInput: Copy + Ord + fmt::Debug + Send + Sync + 'static {
    /// Every input; the output is their logical AND.
    fn all() -> &'static [Self];
}

type OutputListener = Arc<dyn Fn(bool) + Send + Sync>;

struct MuxState<I> {
    inputs: BTreeMap<I, bool>,
    output: bool,
    listeners: Vec<(ListenerId, OutputListener)>,
}

impl<I> MuxState<I> {
    fn dispatch(&self, executor: &ExecutorHandle, value: bool) {
        if self.listeners.is_empty() {
            return;
        }
        let listeners: Vec<OutputListener> =
            self.listeners.iter().map(|(_, l)| l.clone()).collect();
        let outcome = executor.execute(move || {
            for listener in &listeners {
                listener(value);
            }
        });
        if !outcome.is_ok() {
            tracing::debug!(?outcome, value, "conjunction notification dropped");
        }
    }
}

/// Thread-safe AND of named boolean inputs that broadcasts output changes.
///
/// All inputs start `false`. Listeners run on the executor given at
/// construction, in the order the output changed.
///
/// # Example
/// ```rust
/// use focus_core::prelude::*;
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// enum Ready { Buffer, Idle }
///
/// impl ConjunctionInput for Ready {
///     fn all() -> &'static [Self] { &[Ready::Buffer, Ready::Idle] }
/// }
///
/// let exec = TaskExecutor::serial("doc-mux", 8).unwrap();
/// let mux = ConjunctionMux::<Ready>::new(exec.handle());
/// assert!(!mux.set_input(Ready::Buffer, true));
/// assert!(mux.set_input(Ready::Idle, true));
/// assert!(mux.output());
/// ```
pub struct ConjunctionMux<I: ConjunctionInput> {
    state: Mutex<MuxState<I>>,
    executor: ExecutorHandle,
    ids: AtomicU64,
}

impl<I: ConjunctionInput> ConjunctionMux<I> {
    /// # Panics
    /// If `I::all()` is empty.
    pub fn new(executor: ExecutorHandle) -> Self {
        assert!(!I::all().is_empty(), "conjunction needs at least one input");
        Self {
            state: Mutex::new(MuxState {
                inputs: I::all().iter().map(|input| (*input, false)).collect(),
                output: false,
                listeners: Vec::new(),
            }),
            executor,
            ids: AtomicU64::new(0),
        }
    }

    /// Set one input and return the resulting output.
    pub fn set_input(&self, input: I, value: bool) -> bool {
        let mut state = self.state.lock();
        state.inputs.insert(input, value);
        let output = state.inputs.values().all(|v| *v);
        if output != state.output {
            state.output = output;
            tracing::trace!(?input, value, output, "conjunction output changed");
            state.dispatch(&self.executor, output);
        }
        output
    }

    pub fn input(&self, input: I) -> bool {
        self.state.lock().inputs.get(&input).copied().unwrap_or(false)
    }

    pub fn output(&self) -> bool {
        self.state.lock().output
    }

    /// Re-deliver the current output to every listener.
    pub fn notify_listeners(&self) {
        let state = self.state.lock();
        state.dispatch(&self.executor, state.output);
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = ListenerId::next(&self.ids);
        self.state.lock().listeners.push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(existing, _)| *existing != id);
        state.listeners.len() != before
    }
}

impl<I: ConjunctionInput> fmt::Debug for ConjunctionMux<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConjunctionMux")
            .field("inputs", &state.inputs)
            .field("output", &state.output)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskExecutor;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum Input {
        A,
        B,
        C,
    }

    impl ConjunctionInput for Input {
        fn all() -> &'static [Self] {
            &[Input::A, Input::B, Input::C]
        }
    }

    fn recorder(mux: &ConjunctionMux<Input>) -> mpsc::Receiver<bool> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        mux.add_listener(move |value| {
            let _ = tx.lock().send(value);
        });
        rx
    }

    #[test]
    fn listeners_fire_only_on_transitions() {
        let exec = TaskExecutor::serial("mux-transitions", 16).unwrap();
        let mux = ConjunctionMux::new(exec.handle());
        let rx = recorder(&mux);

        assert!(!mux.set_input(Input::A, true));
        assert!(!mux.set_input(Input::B, true));
        assert!(!mux.set_input(Input::B, true));
        assert!(mux.set_input(Input::C, true));
        assert!(mux.set_input(Input::C, true));
        assert!(!mux.set_input(Input::A, false));
        assert!(!mux.set_input(Input::B, false));
        exec.shutdown();

        let seen: Vec<bool> = rx.try_iter().collect();
        assert_eq!(seen, vec![true, false]);
    }

    #[test]
    fn notify_listeners_redelivers_current_output() {
        let exec = TaskExecutor::serial("mux-notify", 16).unwrap();
        let mux = ConjunctionMux::new(exec.handle());
        let rx = recorder(&mux);
        mux.notify_listeners();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(false));
    }

    #[test]
    fn removed_listener_is_silent() {
        let exec = TaskExecutor::serial("mux-remove", 16).unwrap();
        let mux = ConjunctionMux::new(exec.handle());
        let (tx, rx) = mpsc::channel::<bool>();
        let tx = Mutex::new(tx);
        let id = mux.add_listener(move |v| {
            let _ = tx.lock().send(v);
        });
        assert!(mux.remove_listener(id));
        assert!(!mux.remove_listener(id));
        for input in Input::all() {
            mux.set_input(*input, true);
        }
        exec.shutdown();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn output_matches_latest_inputs_under_contention() {
        let exec = TaskExecutor::serial("mux-contention", 1024).unwrap();
        let mux = Arc::new(ConjunctionMux::new(exec.handle()));
        let threads: Vec<_> = Input::all()
            .iter()
            .map(|input| {
                let mux = mux.clone();
                let input = *input;
                thread::spawn(move || {
                    for i in 0..200 {
                        mux.set_input(input, i % 3 != 0);
                    }
                    mux.set_input(input, true);
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert!(mux.output());
        assert!(Input::all().iter().all(|i| mux.input(*i)));
    }

    #[test]
    fn listener_may_reenter_the_mux() {
        let exec = TaskExecutor::serial("mux-reenter", 16).unwrap();
        let mux = Arc::new(ConjunctionMux::new(exec.handle()));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let inner = mux.clone();
        mux.add_listener(move |value| {
            if value {
                inner.set_input(Input::A, false);
            }
            let _ = tx.lock().send(inner.output());
        });
        for input in Input::all() {
            mux.set_input(*input, true);
        }
        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout), Ok(false));
        assert!(!mux.output());
    }
}

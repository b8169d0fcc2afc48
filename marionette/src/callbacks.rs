//! Hook registry fired by the master loop.

use std::collections::HashMap;

/// Points in the master loop where callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// After a child pid was reaped.
    ReapDeadChildren,
    /// The main puppet is at full count and every worker checked in.
    AllWorkersCheckedIn,
}

/// Payload handed to callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Reaped { pid: i32 },
    CheckedIn,
}

type Callback = Box<dyn FnMut(HookEvent)>;

struct Registered {
    callback: Callback,
    limit: usize,
    calls: usize,
}

/// Callbacks keyed by [`Hook`], each with a call limit.
#[derive(Default)]
pub struct Callbacks {
    hooks: HashMap<Hook, Vec<Registered>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `hook`. `limit` of 0 means unlimited, 1 means once.
    pub fn register(&mut self, hook: Hook, limit: usize, callback: impl FnMut(HookEvent) + 'static) {
        self.hooks.entry(hook).or_default().push(Registered {
            callback: Box::new(callback),
            limit,
            calls: 0,
        });
    }

    /// Run every callback of `hook`, dropping the ones that hit their limit.
    pub fn fire(&mut self, hook: Hook, event: HookEvent) {
        let Some(callbacks) = self.hooks.get_mut(&hook) else {
            return;
        };
        for registered in callbacks.iter_mut() {
            (registered.callback)(event);
            registered.calls += 1;
        }
        callbacks.retain(|r| r.limit == 0 || r.calls < r.limit);
    }

    /// Number of callbacks still registered for `hook`.
    pub fn len(&self, hook: Hook) -> usize {
        self.hooks.get(&hook).map_or(0, Vec::len)
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("reap", &self.len(Hook::ReapDeadChildren))
            .field("checked_in", &self.len(Hook::AllWorkersCheckedIn))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_once_callback_fires_once() {
        let calls = Rc::new(RefCell::new(0));
        let mut callbacks = Callbacks::new();
        let counter = Rc::clone(&calls);
        callbacks.register(Hook::AllWorkersCheckedIn, 1, move |_| *counter.borrow_mut() += 1);

        callbacks.fire(Hook::AllWorkersCheckedIn, HookEvent::CheckedIn);
        callbacks.fire(Hook::AllWorkersCheckedIn, HookEvent::CheckedIn);

        assert_eq!(*calls.borrow(), 1);
        assert_eq!(callbacks.len(Hook::AllWorkersCheckedIn), 0);
    }

    #[test]
    fn test_unlimited_callback_sees_every_event() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut callbacks = Callbacks::new();
        let sink = Rc::clone(&seen);
        callbacks.register(Hook::ReapDeadChildren, 0, move |e| sink.borrow_mut().push(e));

        for pid in [10, 11, 12] {
            callbacks.fire(Hook::ReapDeadChildren, HookEvent::Reaped { pid });
        }
        callbacks.fire(Hook::AllWorkersCheckedIn, HookEvent::CheckedIn);

        assert_eq!(seen.borrow().len(), 3);
        assert_eq!(seen.borrow()[2], HookEvent::Reaped { pid: 12 });
        assert_eq!(callbacks.len(Hook::ReapDeadChildren), 1);
    }
}

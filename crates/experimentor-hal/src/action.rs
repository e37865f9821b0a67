//! [`ActionMap`] – named things a model can be asked to do.
//!
//! An action is a one-shot operation such as a camera's `acquire` or a
//! stage's `home`.  Running one spawns a worker thread, so callers are never
//! blocked by the instrument.  All actions of a map share one lock unless
//! they were registered with their own, which means a device that cannot do
//! two things at once gets them one after the other.

use std::sync::Arc;
use std::thread;

use experimentor_types::ExpError;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

pub type ActionFn = Arc<dyn Fn() -> Result<Value, ExpError> + Send + Sync + 'static>;

/// Serialises the actions registered with it.
pub type ActionLock = Arc<Mutex<()>>;

pub type ActionThread = thread::JoinHandle<Result<Value, ExpError>>;

struct Action {
    run: ActionFn,
    lock: ActionLock,
}

/// Actions of one model instance, in registration order.
pub struct ActionMap {
    owner: String,
    shared_lock: ActionLock,
    actions: IndexMap<String, Action>,
}

impl ActionMap {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            shared_lock: Arc::new(Mutex::new(())),
            actions: IndexMap::new(),
        }
    }

    /// Register `f` under the map's shared lock.
    ///
    /// # Errors
    ///
    /// [`ExpError::Property`] if an action with that name exists.
    pub fn insert<F>(&mut self, name: impl Into<String>, f: F) -> Result<(), ExpError>
    where
        F: Fn() -> Result<Value, ExpError> + Send + Sync + 'static,
    {
        let lock = Arc::clone(&self.shared_lock);
        self.insert_with_lock(name, lock, f)
    }

    /// Register `f` under `lock`, for actions the instrument can run
    /// alongside the others.
    pub fn insert_with_lock<F>(
        &mut self,
        name: impl Into<String>,
        lock: ActionLock,
        f: F,
    ) -> Result<(), ExpError>
    where
        F: Fn() -> Result<Value, ExpError> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.actions.contains_key(&name) {
            return Err(ExpError::Property {
                name,
                details: format!("action declared twice on {}", self.owner),
            });
        }
        debug!(model = %self.owner, action = %name, "action registered");
        self.actions.insert(
            name,
            Action {
                run: Arc::new(f),
                lock,
            },
        );
        Ok(())
    }

    /// Start `name` on its own thread.  The thread waits for the action's
    /// lock before running it.
    ///
    /// # Errors
    ///
    /// [`ExpError::Property`] for an unknown action, [`ExpError::HardwareFault`]
    /// if the thread cannot be spawned.
    pub fn run(&self, name: &str) -> Result<ActionThread, ExpError> {
        let action = self.actions.get(name).ok_or_else(|| ExpError::Property {
            name: name.to_string(),
            details: format!("{} has no such action", self.owner),
        })?;
        let run = Arc::clone(&action.run);
        let lock = Arc::clone(&action.lock);
        let owner = self.owner.clone();
        let action_name = name.to_string();
        info!(model = %owner, action = %action_name, "starting action");
        thread::Builder::new()
            .name(format!("action:{name}"))
            .spawn(move || {
                let _guard = lock.lock();
                debug!(model = %owner, action = %action_name, "action running");
                run()
            })
            .map_err(|e| ExpError::HardwareFault {
                component: self.owner.clone(),
                details: format!("spawn action thread: {e}"),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts how many actions run at the same time.
    #[derive(Default)]
    struct Overlap {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Overlap {
        fn busy(&self, label: &'static str) -> Result<Value, ExpError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(150));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(json!(label))
        }
    }

    fn with_two_actions(separate_locks: bool) -> (ActionMap, Arc<Overlap>) {
        let overlap = Arc::new(Overlap::default());
        let mut actions = ActionMap::new("camera");
        let first = Arc::clone(&overlap);
        actions.insert("acquire", move || first.busy("acquire")).unwrap();
        let second = Arc::clone(&overlap);
        if separate_locks {
            let own = Arc::new(Mutex::new(()));
            actions
                .insert_with_lock("cool", own, move || second.busy("cool"))
                .unwrap();
        } else {
            actions.insert("cool", move || second.busy("cool")).unwrap();
        }
        (actions, overlap)
    }

    #[test]
    fn actions_on_the_shared_lock_run_one_at_a_time() {
        let (actions, overlap) = with_two_actions(false);
        let a = actions.run("acquire").unwrap();
        let b = actions.run("cool").unwrap();
        assert_eq!(a.join().unwrap().unwrap(), json!("acquire"));
        assert_eq!(b.join().unwrap().unwrap(), json!("cool"));
        assert_eq!(overlap.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_lock_lets_actions_overlap() {
        let (actions, overlap) = with_two_actions(true);
        let a = actions.run("acquire").unwrap();
        let b = actions.run("cool").unwrap();
        a.join().unwrap().unwrap();
        b.join().unwrap().unwrap();
        assert_eq!(overlap.peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn names_and_errors() {
        let (mut actions, _) = with_two_actions(false);
        assert_eq!(actions.names().collect::<Vec<_>>(), vec!["acquire", "cool"]);
        assert!(actions.contains("cool"));
        assert!(matches!(
            actions.insert("acquire", || Ok(Value::Null)),
            Err(ExpError::Property { .. })
        ));
        assert!(matches!(actions.run("explode"), Err(ExpError::Property { .. })));

        actions
            .insert("fail", || {
                Err(ExpError::HardwareFault {
                    component: "shutter".to_string(),
                    details: "jammed".to_string(),
                })
            })
            .unwrap();
        let result = actions.run("fail").unwrap().join().unwrap();
        assert!(matches!(result, Err(ExpError::HardwareFault { .. })));
        assert_eq!(actions.len(), 3);
    }
}

// Group registry

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use super::Group;

/// Builds a group for an (app, stream) pair
pub type GroupFactory = Box<dyn Fn(&str, &str) -> Arc<Group> + Send + Sync>;

/// Registry of the live groups
pub trait GroupManager: Send + Sync {
    /// Gets the group of a stream, creating it if missing.
    ///
    /// A disposed group is replaced by a new one.
    ///
    /// # Return value
    ///
    /// The group, and true if it was created by this call
    fn get_or_create(&self, app_name: &str, stream_name: &str) -> (Arc<Group>, bool);

    /// Gets the group of a stream
    fn get(&self, app_name: &str, stream_name: &str) -> Option<Arc<Group>>;

    /// Calls a function for every group. Groups for which it returns false are erased.
    fn iterate(&self, f: &mut dyn FnMut(&Arc<Group>) -> bool);

    /// Number of groups
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Groups keyed by stream name only
pub struct SimpleGroupManager {
    factory: GroupFactory,
    groups: Mutex<HashMap<String, Arc<Group>>>,
}

impl SimpleGroupManager {
    pub fn new(factory: GroupFactory) -> SimpleGroupManager {
        SimpleGroupManager {
            factory,
            groups: Mutex::new(HashMap::new()),
        }
    }
}

impl GroupManager for SimpleGroupManager {
    fn get_or_create(&self, app_name: &str, stream_name: &str) -> (Arc<Group>, bool) {
        let mut groups = match self.groups.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(group) = groups.get(stream_name) {
            if !group.is_disposed() {
                return (group.clone(), false);
            }
        }

        let group = (self.factory)(app_name, stream_name);
        groups.insert(stream_name.to_string(), group.clone());

        (group, true)
    }

    fn get(&self, _app_name: &str, stream_name: &str) -> Option<Arc<Group>> {
        let groups = match self.groups.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        groups.get(stream_name).cloned()
    }

    fn iterate(&self, f: &mut dyn FnMut(&Arc<Group>) -> bool) {
        let mut groups = match self.groups.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        groups.retain(|_, group| f(group));
    }

    fn len(&self) -> usize {
        match self.groups.lock() {
            Ok(g) => g.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Groups keyed by (app, stream)
///
/// Lookups tolerate a missing or wrong app name: an empty app
/// searches every app, and an app miss retries by stream name.
pub struct ComplexGroupManager {
    factory: GroupFactory,
    apps: Mutex<HashMap<String, HashMap<String, Arc<Group>>>>,
}

impl ComplexGroupManager {
    pub fn new(factory: GroupFactory) -> ComplexGroupManager {
        ComplexGroupManager {
            factory,
            apps: Mutex::new(HashMap::new()),
        }
    }

    fn find_by_stream_name(
        apps: &HashMap<String, HashMap<String, Arc<Group>>>,
        stream_name: &str,
    ) -> Option<Arc<Group>> {
        apps.values()
            .find_map(|streams| streams.get(stream_name))
            .cloned()
    }
}

impl GroupManager for ComplexGroupManager {
    fn get_or_create(&self, app_name: &str, stream_name: &str) -> (Arc<Group>, bool) {
        let mut apps = match self.apps.lock() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };

        let streams = apps.entry(app_name.to_string()).or_default();

        if let Some(group) = streams.get(stream_name) {
            if !group.is_disposed() {
                return (group.clone(), false);
            }
        }

        let group = (self.factory)(app_name, stream_name);
        streams.insert(stream_name.to_string(), group.clone());

        (group, true)
    }

    fn get(&self, app_name: &str, stream_name: &str) -> Option<Arc<Group>> {
        let apps = match self.apps.lock() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };

        if app_name.is_empty() {
            return Self::find_by_stream_name(&apps, stream_name);
        }

        match apps.get(app_name).and_then(|streams| streams.get(stream_name)) {
            Some(group) => Some(group.clone()),
            None => Self::find_by_stream_name(&apps, stream_name),
        }
    }

    fn iterate(&self, f: &mut dyn FnMut(&Arc<Group>) -> bool) {
        let mut apps = match self.apps.lock() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };

        for streams in apps.values_mut() {
            streams.retain(|_, group| f(group));
        }

        apps.retain(|_, streams| !streams.is_empty());
    }

    fn len(&self) -> usize {
        let apps = match self.apps.lock() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };

        apps.values().map(|streams| streams.len()).sum()
    }
}

// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        base::ManualClock,
        callback::NoopObserver,
        group::{GroupConfiguration, GroupContext},
        log::Logger,
        server::SessionIdGenerator,
    };

    fn make_factory() -> GroupFactory {
        let context = GroupContext {
            config: Arc::new(GroupConfiguration::default()),
            observer: Arc::new(NoopObserver),
            clock: Arc::new(ManualClock::new(0)),
            session_id_generator: Arc::new(SessionIdGenerator::new()),
        };

        let logger = Logger::new_disabled();

        Box::new(move |app_name: &str, stream_name: &str| {
            Arc::new(Group::new(&logger, app_name, stream_name, context.clone()))
        })
    }

    #[test]
    fn test_simple_manager_keys_by_stream_name() {
        let manager = SimpleGroupManager::new(make_factory());

        let (g1, created1) = manager.get_or_create("live", "test");
        let (g2, created2) = manager.get_or_create("other", "test");

        assert!(created1);
        assert!(!created2);
        assert!(Arc::ptr_eq(&g1, &g2));
        assert_eq!(manager.len(), 1);

        assert!(manager.get("whatever", "test").is_some());
        assert!(manager.get("live", "nope").is_none());
    }

    #[test]
    fn test_complex_manager_fallback_lookup() {
        let manager = ComplexGroupManager::new(make_factory());

        let (g1, _) = manager.get_or_create("live", "test");
        let (g2, created) = manager.get_or_create("other", "test");

        assert!(created);
        assert!(!Arc::ptr_eq(&g1, &g2));
        assert_eq!(manager.len(), 2);

        let found = manager.get("live", "test").unwrap();
        assert!(Arc::ptr_eq(&found, &g1));

        // Empty app searches every app
        assert!(manager.get("", "test").is_some());

        // App miss retries by stream name
        assert!(manager.get("missing", "test").is_some());
        assert!(manager.get("live", "missing").is_none());
    }

    #[test]
    fn test_iterate_erases() {
        let manager = ComplexGroupManager::new(make_factory());

        manager.get_or_create("live", "a");
        manager.get_or_create("live", "b");
        manager.get_or_create("other", "c");

        manager.iterate(&mut |g| g.stream_name() != "b");

        assert_eq!(manager.len(), 2);
        assert!(manager.get("live", "b").is_none());

        manager.iterate(&mut |_| false);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_disposed_group_is_replaced() {
        let manager = SimpleGroupManager::new(make_factory());

        let (g1, _) = manager.get_or_create("live", "test");
        g1.dispose().await;

        let (g2, created) = manager.get_or_create("live", "test");

        assert!(created);
        assert!(!Arc::ptr_eq(&g1, &g2));
    }
}

use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
///
/// Every critical section in the engine leaves its data consistent before
/// anything that can panic runs, so a poisoned lock is still usable.
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(lock = what, "mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_lock_recovers_poisoned_mutex() {
        let shared = Arc::new(Mutex::new(vec![1]));
        let poisoner = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                let mut guard = shared.lock().unwrap();
                guard.push(2);
                panic!("poison");
            })
        };
        assert!(poisoner.join().is_err());
        assert!(shared.is_poisoned());

        let guard = lock(&shared, "test");
        assert_eq!(*guard, vec![1, 2]);
    }
}

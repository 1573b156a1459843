//! Latest-value state container with change notification.

use tokio::sync::watch;

/// Holds the current value of some piece of session state.
///
/// Reads are synchronous snapshots; observers get a [`watch::Receiver`] that is
/// woken on every update.
#[derive(Debug)]
pub struct Observable<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> Observable<T> {
    pub fn new(value: T) -> Self {
        let (tx, _) = watch::channel(value);
        Self { tx }
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the value and notify observers.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Mutate in place and notify observers.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.tx.send_modify(f);
    }

    /// Mutate in place, notifying only when `f` reports a change.
    pub fn update_if(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    /// Read through a borrow without cloning.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone + Default> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn observers_see_updates() {
        let value = Observable::new(1u32);
        let mut rx = value.subscribe();
        value.set(2);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 2);
        value.update(|v| *v += 1);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 3);
        assert_eq!(value.get(), 3);
    }

    #[test]
    fn update_if_skips_unchanged() {
        let value = Observable::new(vec![1]);
        let rx = value.subscribe();
        assert!(!value.update_if(|_| false));
        assert!(!rx.has_changed().unwrap());
        assert!(value.update_if(|v| {
            v.push(2);
            true
        }));
        assert!(rx.has_changed().unwrap());
        assert_eq!(value.with(|v| v.len()), 2);
    }

    #[test]
    fn works_without_observers() {
        let value = Observable::<String>::default();
        value.set("a".into());
        assert_eq!(value.get(), "a");
    }
}

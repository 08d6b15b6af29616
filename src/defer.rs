//! Scope-exit helper: closers registered while work proceeds run in reverse
//! order when the guard drops, on every exit path including cancellation.

/// Runs registered closers in reverse registration order on drop.
#[derive(Default)]
pub struct Deferred {
    closers: Vec<Box<dyn FnOnce() + Send>>,
}

impl Deferred {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F: FnOnce() + Send + 'static>(&mut self, closer: F) {
        self.closers.push(Box::new(closer));
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        while let Some(closer) = self.closers.pop() {
            closer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn closers_run_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let mut deferred = Deferred::new();
            for i in 0..3 {
                let order = order.clone();
                deferred.push(move || order.lock().unwrap().push(i));
            }
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn closers_run_on_early_exit() {
        let ran = Arc::new(Mutex::new(false));
        let result: Result<(), ()> = (|| {
            let mut deferred = Deferred::new();
            let ran = ran.clone();
            deferred.push(move || *ran.lock().unwrap() = true);
            Err(())
        })();
        assert!(result.is_err());
        assert!(*ran.lock().unwrap());
    }
}

//! Undo list for constructors that create several Vulkan objects in a row.

/// Undo steps recorded while building a compound object.
///
/// Dropping the list runs the steps newest first. [`commit`](Self::commit)
/// discards them once every part exists and ownership has moved into the
/// finished object.
#[must_use = "dropping a rollback immediately undoes everything recorded"]
pub(crate) struct Rollback<'a> {
    undo: Vec<Box<dyn FnOnce() + 'a>>,
}

impl<'a> Rollback<'a> {
    pub(crate) fn new() -> Self {
        Self { undo: Vec::new() }
    }

    /// Record how to release the object created last.
    pub(crate) fn push(&mut self, undo: impl FnOnce() + 'a) {
        self.undo.push(Box::new(undo));
    }

    /// Keep everything that was created.
    pub(crate) fn commit(mut self) {
        self.undo.clear();
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        while let Some(undo) = self.undo.pop() {
            undo();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    fn build(log: &RefCell<Vec<&'static str>>, fail_at: Option<usize>) -> Result<(), usize> {
        let mut rollback = Rollback::new();
        for (step, name) in ["pool", "semaphore", "fence"].into_iter().enumerate() {
            if fail_at == Some(step) {
                return Err(step);
            }
            log.borrow_mut().push(name);
            rollback.push(move || log.borrow_mut().push(name));
        }
        rollback.commit();
        Ok(())
    }

    #[test]
    fn failure_releases_in_reverse_order() {
        let log = RefCell::new(Vec::new());
        assert_eq!(build(&log, Some(2)), Err(2));
        assert_eq!(*log.borrow(), vec!["pool", "semaphore", "semaphore", "pool"]);
    }

    #[test]
    fn first_step_failure_releases_nothing() {
        let log = RefCell::new(Vec::new());
        assert_eq!(build(&log, Some(0)), Err(0));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn commit_keeps_everything() {
        let log = RefCell::new(Vec::new());
        assert_eq!(build(&log, None), Ok(()));
        assert_eq!(*log.borrow(), vec!["pool", "semaphore", "fence"]);
    }
}

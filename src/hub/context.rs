//! The hub of the current thread.
//!
//! Every thread gets its own hub, built on first use from the process-wide
//! defaults. [`enter`] swaps another hub in for the duration of a closure
//! and puts the previous one back afterwards.

use crate::builder::HubBuilder;
use crate::error::Result;
use crate::hub::Hub;

use std::cell::RefCell;

thread_local! {
    /// Hub used by [`Hub::current`] and the free functions of this crate.
    static CURRENT_HUB: RefCell<Option<Hub>> = const { RefCell::new(None) };
}

/// Returns this thread's hub, creating it if needed.
pub(crate) fn current() -> Result<Hub> {
    if let Some(hub) = peek() {
        return Ok(hub);
    }

    let hub = HubBuilder::new().build()?;
    log::debug!("created hub with {} backend", hub.backend_kind());
    install(hub.clone());

    Ok(hub)
}

/// Returns this thread's hub without creating one.
pub(crate) fn peek() -> Option<Hub> {
    CURRENT_HUB
        .try_with(|current| current.borrow().clone())
        .ok()
        .flatten()
}

/// Makes `hub` this thread's hub, returning the one it replaces.
pub(crate) fn install(hub: Hub) -> Option<Hub> {
    CURRENT_HUB.with(|current| current.borrow_mut().replace(hub))
}

/// Runs `function` with `hub` as this thread's hub.
pub(crate) fn enter<F, R>(hub: Hub, function: F) -> R
where
    F: FnOnce() -> R,
{
    struct Restore(Option<Hub>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            let replaced = CURRENT_HUB
                .try_with(|current| std::mem::replace(&mut *current.borrow_mut(), previous));
            drop(replaced);
        }
    }

    let _restore = Restore(install(hub));

    function()
}

//! IO safety remap scope.

use crate::context::MachineContext;
use plumb_common::error::HomingResult;
use tracing::{debug, warn};

/// Run `f` with the IO remap engaged. The remap is reverted on both the
/// success and the error path; a failed revert after success is reported.
pub fn with_io_remap<T>(
    ctx: &mut MachineContext,
    f: impl FnOnce(&mut MachineContext) -> HomingResult<T>,
) -> HomingResult<T> {
    if let Some(remap) = ctx.io_remap.as_deref_mut() {
        remap.set_remap(true)?;
        debug!("io remap engaged");
    }

    let result = f(ctx);

    if let Some(remap) = ctx.io_remap.as_deref_mut() {
        match remap.set_remap(false) {
            Ok(()) => debug!("io remap reverted"),
            Err(e) => {
                warn!("failed to revert io remap: {e}");
                if result.is_ok() {
                    return Err(e);
                }
            }
        }
    }
    result
}

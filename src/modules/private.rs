//! `private`: pure pass-through atop the baseline, no events.

use crate::module::{Module, ModuleCore};

pub struct PrivateModule {
    core: ModuleCore,
}

impl PrivateModule {
    pub fn new(core: ModuleCore) -> Self {
        PrivateModule { core }
    }
}

impl Module for PrivateModule {
    fn core(&self) -> &ModuleCore {
        &self.core
    }
}

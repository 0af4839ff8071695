pub mod check;
pub mod inspect;

use std::path::Path;

use anyhow::Context;
use offergrid_state::StateStore;

pub(crate) fn open_store(path: &Path) -> anyhow::Result<StateStore> {
    StateStore::open(path).with_context(|| format!("opening state store {}", path.display()))
}

//! Version-control collaborators.

pub mod git;

use std::path::PathBuf;

use waypoint_core::vcs::BoxVcs;
use waypoint_types::config::{VcsConfig, VcsKind};

pub use git::GitCheckpointer;

/// Build the collaborator named in the config.
///
/// A git collaborator without an explicit repository works on the current
/// directory.
pub fn build_vcs(config: &VcsConfig) -> BoxVcs {
    match config.kind {
        VcsKind::None => BoxVcs::noop(),
        VcsKind::Git => {
            let repository = config
                .repository
                .clone()
                .unwrap_or_else(|| PathBuf::from("."));
            BoxVcs::new(GitCheckpointer::new(repository))
        }
    }
}

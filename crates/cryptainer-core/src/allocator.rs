//! Loop-device and mapper-name allocation.
//!
//! Both entry points are re-entrant: asking for a resource the container
//! already holds returns the existing binding instead of creating a
//! duplicate, which is what makes a retry after an aborted operation safe.

use crate::error::{CryptainerError, CryptainerResult};
use crate::resources::{BlockCrypto, LoopDevices, MappingState};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

const MAX_NAME_PROBES: u32 = 1000;

/// Bind `backing` to a loop device, reusing an existing binding when the
/// kernel already has one. Returns the device node and whether this call
/// created the binding.
pub fn ensure_loop_attached<L>(loops: &L, backing: &Path) -> CryptainerResult<(String, bool)>
where
    L: LoopDevices<Error = CryptainerError>,
{
    let canonical = canonicalize_lossy(backing);
    for binding in loops.list_active()? {
        if canonicalize_lossy(&binding.backing_file) == canonical {
            return Ok((binding.device, false));
        }
    }

    let device = loops.attach(backing)?;
    Ok((device, true))
}

/// Derive a mapper name from `hint` that is inactive on the live system and
/// unused by any registered container. The kernel is ground truth here: a
/// mapping created by another tool under the same name must be avoided even
/// though the registry has never heard of it.
pub fn next_free_mapper_name<C>(
    crypto: &C,
    prefix: &str,
    hint: &str,
    reserved: &HashSet<String>,
) -> CryptainerResult<String>
where
    C: BlockCrypto<Error = CryptainerError>,
{
    let sanitized = sanitize_hint(hint);

    for idx in 1..=MAX_NAME_PROBES {
        let candidate = format!("{prefix}_{sanitized}_{idx}");
        if reserved.contains(&candidate) {
            continue;
        }
        match crypto.status(&candidate)? {
            MappingState::Inactive => return Ok(candidate),
            // An unknown state could hide a live mapping; keep probing.
            MappingState::Active | MappingState::Unknown(_) => continue,
        }
    }

    let fallback = format!("{prefix}_{sanitized}_{}", std::process::id());
    if !reserved.contains(&fallback)
        && matches!(crypto.status(&fallback)?, MappingState::Inactive)
    {
        return Ok(fallback);
    }

    Err(CryptainerError::NameInUse(format!(
        "{prefix}_{sanitized}_*"
    )))
}

/// Reduce a hint to characters every mapper consumer accepts.
fn sanitize_hint(hint: &str) -> String {
    let sanitized: String = hint
        .trim()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect();
    if sanitized.chars().all(|ch| ch == '_') || sanitized.is_empty() {
        "container".to_string()
    } else {
        sanitized
    }
}

fn canonicalize_lossy(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_alphanumerics() {
        assert_eq!(sanitize_hint("secure"), "secure");
        assert_eq!(sanitize_hint("my data.img"), "my_data_img");
        assert_eq!(sanitize_hint("  "), "container");
        assert_eq!(sanitize_hint("///"), "container");
    }
}

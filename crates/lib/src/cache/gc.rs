use std::fs;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{CacheError, CacheState, ObjectStore};

#[derive(Debug, Default, Clone, Serialize)]
pub struct GcStats {
  pub objects_scanned: usize,
  pub objects_removed: usize,
  pub bytes_freed: u64,
}

/// Delete blobs no node record references, plus leftover temp files.
pub fn sweep_objects(objects: &ObjectStore, state: &CacheState, dry_run: bool) -> Result<GcStats, CacheError> {
  let mut stats = GcStats::default();
  let entries = match fs::read_dir(objects.dir()) {
    Ok(entries) => entries,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
    Err(e) => return Err(CacheError::Read(e)),
  };

  let live = state.live_objects();
  for entry in entries.flatten() {
    let path = entry.path();
    if !path.is_file() {
      continue;
    }
    stats.objects_scanned += 1;

    let name = match path.file_name().and_then(|n| n.to_str()) {
      Some(name) => name.to_string(),
      None => continue,
    };
    if live.contains(name.as_str()) {
      continue;
    }

    let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
    debug!(path = %path.display(), "removing unreferenced object");
    if dry_run {
      stats.objects_removed += 1;
      stats.bytes_freed += size;
      continue;
    }
    match fs::remove_file(&path) {
      Ok(()) => {
        stats.objects_removed += 1;
        stats.bytes_freed += size;
      }
      Err(e) => warn!(path = %path.display(), error = %e, "failed to delete object"),
    }
  }

  info!(
    scanned = stats.objects_scanned,
    removed = stats.objects_removed,
    bytes_freed = stats.bytes_freed,
    dry_run,
    "object sweep complete"
  );
  Ok(stats)
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use super::*;
  use crate::engine::NodeRecord;
  use crate::node::NodeId;
  use crate::util::testutil::store;

  #[test]
  fn sweeps_only_unreferenced_objects() {
    let temp = tempfile::tempdir().unwrap();
    let objects = ObjectStore::new(temp.path().join("objects"));
    let kept = store(&[("a.js", "keep me")]);
    let dropped = store(&[("b.js", "drop me")]);
    objects.put_all(&kept).unwrap();
    objects.put_all(&dropped).unwrap();
    fs::write(objects.dir().join("stale.tmp"), "x").unwrap();

    let mut state = CacheState::default();
    state.nodes.insert(
      NodeId::from("compiled"),
      NodeRecord {
        input_fingerprint: kept.fingerprint(),
        output_fingerprint: kept.fingerprint(),
        entries: Some(kept.iter().map(|e| (e.path.clone(), e.fingerprint.clone())).collect::<BTreeMap<_, _>>()),
        diagnostics: Vec::new(),
      },
    );

    let preview = sweep_objects(&objects, &state, true).unwrap();
    assert_eq!(preview.objects_removed, 2);
    assert_eq!(fs::read_dir(objects.dir()).unwrap().count(), 3);

    let stats = sweep_objects(&objects, &state, false).unwrap();
    assert_eq!(stats.objects_scanned, 3);
    assert_eq!(stats.objects_removed, 2);
    assert_eq!(stats.bytes_freed, ("drop me".len() + 1) as u64);
    for entry in kept.iter() {
      assert!(objects.contains(&entry.fingerprint));
    }
    for entry in dropped.iter() {
      assert!(!objects.contains(&entry.fingerprint));
    }
  }

  #[test]
  fn missing_objects_dir_is_empty_sweep() {
    let temp = tempfile::tempdir().unwrap();
    let objects = ObjectStore::new(temp.path().join("nothing"));
    let stats = sweep_objects(&objects, &CacheState::default(), false).unwrap();
    assert_eq!(stats.objects_scanned, 0);
  }
}

use std::{fs, path::Path, time::SystemTime};

/// Decides whether `output` must be (re)built from `inputs`.
///
/// True when the output is absent, when any input is absent, or when the
/// newest input is strictly newer than the output. With no inputs this is an
/// existence check on the output only. Always hits the filesystem: sibling
/// tasks may produce shared inputs between two calls.
pub fn is_outdated<P>(output: &Path, inputs: &[P]) -> bool
where
    P: AsRef<Path>,
{
    let produced = match modified(output) {
        Some(t) => t,
        None => return true,
    };
    let mut newest: Option<SystemTime> = None;
    for input in inputs {
        match modified(input.as_ref()) {
            Some(t) => newest = Some(newest.map_or(t, |n| n.max(t))),
            None => return true,
        }
    }
    match newest {
        Some(t) => produced < t,
        None => false,
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

//! In-memory tar archive construction for the per-task file injection.
//!
//! Pure and allocation-only: building the archive never touches the
//! container runtime, which keeps it cheaply unit-testable.

use std::io;

use tar::{Builder, Header};

/// Mode bits for the injected script: executable by its owner.
pub const SCRIPT_MODE: u32 = 0o755;
/// Mode bits for the injected payload: readable/writable by its owner.
pub const PAYLOAD_MODE: u32 = 0o644;

/// Build a tar archive containing `/script.py` and `/payload.json` with the
/// given bytes, suitable for streaming into a container root via a
/// copy-in-to-container call.
pub fn build_task_archive(script: &[u8], payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());

    append_entry(&mut builder, "script.py", SCRIPT_MODE, script)?;
    append_entry(&mut builder, "payload.json", PAYLOAD_MODE, payload)?;

    builder.into_inner()
}

fn append_entry(
    builder: &mut Builder<Vec<u8>>,
    name: &str,
    mode: u32,
    contents: &[u8],
) -> io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_path(name)?;
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    builder.append(&header, contents)
}

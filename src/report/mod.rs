//! Result handoff to report collaborators
//!
//! The core has no opinion on document formats; the only bundled renderer
//! is a plain JSON export of the finalized `ScanResult`.

pub mod json;

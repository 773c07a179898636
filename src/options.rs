use std::path::PathBuf;

/// Configuration for [`crate::pack::Packer`].
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    /// Send blocks that classify as nothing known as full blocks instead of
    /// leaving them out.
    pub pack_unknown:            bool,
    /// Go on without the journal when it lives on a device that was not
    /// supplied.
    pub allow_missing_journal:   bool,
    /// Record every extent pointer and emit the set before the end record.
    pub emit_unformatted_bitmap: bool,
    /// Reject extent pointers past the end of the filesystem.  Off by
    /// default: a damaged image is exactly what this tool is for.
    pub check_ranges:            bool,
    /// Name recorded in the separated-journal marker.
    pub journal_name:            Option<String>,
}

/// Configuration for [`crate::unpack::StreamUnpacker`].
#[derive(Debug, Clone, Default)]
pub struct UnpackOptions {
    /// Where to save the bitmap of restored blocks when the run finishes.
    pub bitmap_out: Option<PathBuf>,
}

// Error types. The virtual machine core itself never fails at runtime --
// guest faults are delivered as interrupts, host-service failures are
// communicated back to guest code through the AL=0 convention -- so the
// only `Result`-returning surface here is the one-time setup path
// (loading a BIOS image, opening disk/config files) and the host binary's
// own argument handling. Modeled on the teacher's preference for
// `thiserror` over hand-rolled `impl std::error::Error`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BiosLoadError {
    #[error("BIOS image is {len} bytes, too small to hold the decode-table header")]
    TooSmall { len: usize },

    #[error("BIOS image ({len} bytes) does not fit in the guest address space below the register overlay")]
    TooLarge { len: usize },

    #[error("decode table {index} offset {offset:#06x} runs past the end of the BIOS image")]
    TableOutOfBounds { index: usize, offset: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read BIOS image {path}: {source}")]
    BiosIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open disk image {path}: {source}")]
    DiskIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    BiosFormat(#[from] BiosLoadError),

    #[error("--hdboot given without -c <hard disk image>")]
    HdBootWithoutDisk,
}

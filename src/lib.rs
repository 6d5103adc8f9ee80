//! Provisioning of raw SD-card disk images.
//!
//! Boards boot from an `sd_card.img` with a FAT boot partition (kernel,
//! device tree, BOOT.BIN, boot script) and a Linux root filesystem. This
//! crate updates such an image in place without flashing it: partitions are
//! located by reading the partition table, loop mounted at a byte offset,
//! written to, and unmounted again.
//!
//! - **Partition geometry** - `fdisk -l` parsing, locale tolerant
//! - **Mount lifecycle** - loop mounts with a registry and forced recovery
//! - **Artifact deployment** - privileged copies into mounted partitions
//! - **Pipelines** - kernel selection, workspace overlay, ramdisk
//!   extraction and Xen hypervisor setup
//! - **Firmware selection** - listing deployed firmware and switching between them
//! - **Preflight checks** - host tool validation before acting
//!
//! # Architecture
//!
//! ```text
//! sdimage (binary)
//!     │
//!     └── pipeline::Provisioner
//!             ├── mount::MountManager ──── partition::PartitionTableReader
//!             ├── deploy::Deployer
//!             └── firmware::FirmwareLayout
//!
//! every external tool ──── process::CommandRunner (HostRunner on the host)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use sdimage::firmware::{FirmwareLayout, KernelVariant};
//! use sdimage::partition::FdiskTable;
//! use sdimage::pipeline::{ProvisionContext, Provisioner, ProvisioningRequest};
//! use sdimage::process::HostRunner;
//!
//! let runner = HostRunner;
//! let table = FdiskTable::new(&runner, config.timeouts.query());
//! let mut provisioner = Provisioner::new(&runner, &table, firmware, context);
//! provisioner.select_kernel(&ProvisioningRequest {
//!     kernel: KernelVariant::PreemptRt,
//!     ..Default::default()
//! })?;
//! ```

pub mod config;
pub mod deploy;
pub mod error;
pub mod firmware;
pub mod mount;
pub mod partition;
pub mod pipeline;
pub mod preflight;
pub mod process;

pub use error::{ProvisionError, Result};
pub use firmware::{FirmwareCatalog, FirmwareLayout, KernelVariant};
pub use mount::{MountHandle, MountManager, MountMode};
pub use partition::{PartitionGeometry, PartitionTableReader, RawImage};
pub use pipeline::{PipelineRun, Provisioner, Stage};

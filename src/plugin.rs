//! Plugin entry points: build devices from the simulator's option strings.
//!
//! The simulator hands each device plugin its options as a list of
//! `key=value` strings (e.g. `--device=virtioblk,img=fs.img,mode=snapshot`).
//! Construction is split in two layers: the `*_from_args` functions return
//! errors for the host to handle, and the `*_plugin` wrappers reproduce the
//! plugin contract of printing a diagnostic to stdout and terminating
//! before the guest runs.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::rc::Rc;

use thiserror::Error;

use crate::fs::HostDir;
use crate::irq::{InterruptController, IrqLine};
use crate::virtio::{Blk, DiskImage, DiskMode, NineP, Virtio};

/// MMIO window of the block device.
pub const VIRTIO_BLK_BASE: u64 = 0x4001_0000;
pub const VIRTIO_BLK_IRQ: u32 = 1;

/// MMIO window of the 9P device, one stride above the block device.
pub const VIRTIO_9P_BASE: u64 = 0x4001_1000;
pub const VIRTIO_9P_IRQ: u32 = 2;

/// Size of each device's MMIO region.
pub const VIRTIO_MMIO_SIZE: u64 = 0x1000;

/// Device initialization failures. These surface before the guest runs.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("`{key}` argument not specified; use --device={device},{key}={example}")]
    MissingArgument {
        device: &'static str,
        key: &'static str,
        example: &'static str,
    },
    #[error("cannot open image `{path}`: {source}")]
    BadImage { path: String, source: io::Error },
    #[error("`path` {path} must be an existing directory: {source}")]
    BadExport { path: String, source: io::Error },
}

/// The simulator's `key=value` option strings, split into a map. Entries
/// without a `=` are ignored, later duplicates win.
pub struct DeviceArgs(HashMap<String, String>);

impl DeviceArgs {
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Self {
        let mut map = HashMap::new();
        for arg in args {
            if let Some((key, value)) = arg.as_ref().split_once('=') {
                map.insert(key.to_owned(), value.to_owned());
            }
        }
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

fn disk_mode(args: &DeviceArgs) -> DiskMode {
    match args.get("mode") {
        Some("ro") => DiskMode::ReadOnly,
        Some("snapshot") => DiskMode::Snapshot,
        _ => DiskMode::ReadWrite,
    }
}

/// Build the block device from `img=<path>` and `mode=ro|rw|snapshot`
/// (default rw).
pub fn block_from_args(args: &DeviceArgs, irq: IrqLine) -> Result<Virtio<Blk>, PluginError> {
    let img = args.get("img").ok_or(PluginError::MissingArgument {
        device: "virtioblk",
        key: "img",
        example: "file",
    })?;
    let disk = DiskImage::open(Path::new(img), disk_mode(args)).map_err(|source| {
        PluginError::BadImage {
            path: img.to_owned(),
            source,
        }
    })?;
    Ok(Virtio::new(Blk::new(Box::new(disk)), irq))
}

/// Build the 9P device from `path=<host-dir>` and `tag=<name>` (default
/// `/dev/root`).
pub fn p9_from_args(
    args: &DeviceArgs,
    irq: IrqLine,
) -> Result<Virtio<NineP<HostDir>>, PluginError> {
    let path = args.get("path").ok_or(PluginError::MissingArgument {
        device: "virtio9p",
        key: "path",
        example: "/path/to/folder",
    })?;
    let tag = args.get("tag").unwrap_or("/dev/root");
    let host = HostDir::new(Path::new(path)).map_err(|source| PluginError::BadExport {
        path: path.to_owned(),
        source,
    })?;
    Ok(Virtio::new(NineP::new(host, tag), irq))
}

/// Plugin entry for the block device. Prints a diagnostic and terminates
/// on a bad configuration.
pub fn block_plugin(args: &[String], intc: Rc<dyn InterruptController>) -> Virtio<Blk> {
    let args = DeviceArgs::parse(args);
    match block_from_args(&args, IrqLine::new(intc, VIRTIO_BLK_IRQ)) {
        Ok(dev) => dev,
        Err(err) => {
            println!("virtio block device plugin init error: {err}");
            std::process::exit(1);
        }
    }
}

/// Plugin entry for the 9P device. Prints a diagnostic and terminates on a
/// bad configuration.
pub fn p9_plugin(args: &[String], intc: Rc<dyn InterruptController>) -> Virtio<NineP<HostDir>> {
    let args = DeviceArgs::parse(args);
    match p9_from_args(&args, IrqLine::new(intc, VIRTIO_9P_IRQ)) {
        Ok(dev) => dev,
        Err(err) => {
            println!("virtio 9p disk fs device plugin init error: {err}");
            std::process::exit(1);
        }
    }
}

/// Flattened-device-tree fragment describing one VirtIO-MMIO window, in the
/// form the simulator splices into its generated tree.
pub fn generate_dts(label: &str, base: u64, irq: u32) -> String {
    format!(
        "    {label}: virtio@{base:x} {{\n\
         \x20     compatible = \"virtio,mmio\";\n\
         \x20     interrupt-parent = <&PLIC>;\n\
         \x20     interrupts = <{irq}>;\n\
         \x20     reg = <0x{:x} 0x{:x} 0x{:x} 0x{:x}>;\n\
         \x20   }};\n",
        base >> 32,
        base & 0xffff_ffff,
        VIRTIO_MMIO_SIZE >> 32,
        VIRTIO_MMIO_SIZE & 0xffff_ffff,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::NullIntc;

    fn line() -> IrqLine {
        IrqLine::new(Rc::new(NullIntc), VIRTIO_BLK_IRQ)
    }

    #[test]
    fn args_split_on_the_first_equals() {
        let args = DeviceArgs::parse(&["img=/tmp/a=b.img", "mode=ro", "bogus"]);
        assert_eq!(args.get("img"), Some("/tmp/a=b.img"));
        assert_eq!(args.get("mode"), Some("ro"));
        assert_eq!(args.get("bogus"), None);
    }

    #[test]
    fn block_requires_the_image_argument() {
        let args = DeviceArgs::parse::<&str>(&[]);
        let err = block_from_args(&args, line()).unwrap_err();
        assert!(matches!(err, PluginError::MissingArgument { key: "img", .. }));
    }

    #[test]
    fn block_mode_defaults_to_read_write() {
        use std::io::Write as _;
        let mut img = tempfile::NamedTempFile::new().unwrap();
        img.write_all(&[0u8; 1024]).unwrap();
        let path = format!("img={}", img.path().display());

        let dev = block_from_args(&DeviceArgs::parse(&[path.as_str()]), line()).unwrap();
        assert_eq!(dev.backend().sector_count(), 2);

        let dev = block_from_args(
            &DeviceArgs::parse(&[path.as_str(), "mode=snapshot"]),
            line(),
        )
        .unwrap();
        let mut cfg = [0u8; 8];
        assert!(dev.load(0x100, &mut cfg));
        assert_eq!(u64::from_le_bytes(cfg), 2);
    }

    #[test]
    fn p9_requires_a_directory() {
        let args = DeviceArgs::parse::<&str>(&[]);
        assert!(matches!(
            p9_from_args(&args, line()).unwrap_err(),
            PluginError::MissingArgument { key: "path", .. }
        ));

        let args = DeviceArgs::parse(&["path=/definitely/not/here"]);
        assert!(matches!(
            p9_from_args(&args, line()).unwrap_err(),
            PluginError::BadExport { .. }
        ));
    }

    #[test]
    fn p9_tag_defaults_to_dev_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = format!("path={}", dir.path().display());
        let dev = p9_from_args(&DeviceArgs::parse(&[path.as_str()]), line()).unwrap();
        assert_eq!(dev.backend().mount_tag(), "/dev/root");
        let cfg = dev.transport().config();
        assert_eq!(&cfg[..2], &9u16.to_le_bytes());
        assert_eq!(&cfg[2..], b"/dev/root");
    }

    #[test]
    fn dts_fragment_shape() {
        let dts = generate_dts("virtioblk", VIRTIO_BLK_BASE, VIRTIO_BLK_IRQ);
        assert!(dts.contains("virtioblk: virtio@40010000 {"));
        assert!(dts.contains("compatible = \"virtio,mmio\";"));
        assert!(dts.contains("interrupt-parent = <&PLIC>;"));
        assert!(dts.contains("interrupts = <1>;"));
        assert!(dts.contains("reg = <0x0 0x40010000 0x0 0x1000>;"));
    }
}

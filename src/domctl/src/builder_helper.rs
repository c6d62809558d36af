// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Protocol with the short-lived helper process that builds, saves and
//! restores a domain.
//!
//! The helper speaks a line protocol on two pipes: the data channel carries
//! the terminal `result`/`error` frame plus the `suspend` rendezvous, the
//! debug channel carries `debug` text and `progress` percentages. For
//! save/restore it additionally inherits the image file descriptor and
//! reads/writes the image payload directly; the engine brackets that
//! payload with the saved-domain magic and, for HVM guests, the framed
//! device-model state record.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use log::{debug, warn};

use crate::task::TaskHandle;
use crate::DomId;

/// Magic written at the head of every saved-domain image.
pub const SAVE_MAGIC: &[u8] = b"XenSavedDomain\n";
/// Magic framing the device-model state that follows an HVM save payload.
pub const DM_MAGIC: &[u8] = b"QemuDeviceModelRecord\n";

// Defensive cap on the device-model record length field.
const DM_RECORD_CAP: u32 = 128 << 20;

// Fd slot the helper inherits the image on.
const IMAGE_FD: i32 = 3;

/// Errors from the helper protocol and the save-image codec.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum HelperError {
    /// Bad magic in saved-domain image
    BadSignature,
    /// Truncated device-model state record
    TruncatedDmState,
    /// Domain builder failed
    BuildFailed,
    /// Builder helper spoke out of protocol: {0}
    Protocol(String),
    /// Builder helper reported: {0}
    Reported(String),
    /// Operation was cancelled
    Cancelled,
    /// Helper I/O failed: {0}
    Io(#[from] io::Error),
}

/// One frame of the helper's line protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Free-form text for the log.
    Debug(String),
    /// Percent complete, clamped to [0, 100].
    Progress(u32),
    /// The helper is ready for the guest to be told to suspend.
    Suspend,
    /// Terminal success, with the result words.
    Result(String),
    /// Terminal failure, with the helper's message.
    Error(String),
}

/// Parses one protocol line. Progress lines carry a short `\b\b\b\b`
/// redraw prefix and a decimal percent, possibly suffixed with `%`.
pub fn parse_frame(line: &str) -> Result<Frame, HelperError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (keyword, rest) = match line.find(' ') {
        Some(idx) => (&line[..idx], line[idx + 1..].to_string()),
        None => (line, String::new()),
    };
    match keyword {
        "debug" => Ok(Frame::Debug(rest)),
        "progress" => {
            let digits: String = rest
                .chars()
                .filter(|c| !matches!(c, '\u{8}' | '%' | ' '))
                .collect();
            let percent = digits
                .parse::<u32>()
                .map_err(|_| HelperError::Protocol(format!("bad progress frame: {:?}", line)))?;
            Ok(Frame::Progress(percent.min(100)))
        }
        "suspend" => Ok(Frame::Suspend),
        "result" => Ok(Frame::Result(rest)),
        "error" => Ok(Frame::Error(rest)),
        _ => Err(HelperError::Protocol(format!(
            "unknown frame keyword: {:?}",
            line
        ))),
    }
}

/// Result of a domain build: the store and console ring frame numbers and
/// the guest ABI protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    /// Machine frame number of the store ring.
    pub store_mfn: u64,
    /// Machine frame number of the console ring.
    pub console_mfn: u64,
    /// Guest ABI, `x86_32-abi`, `x86_64-abi` or a native name.
    pub protocol: String,
}

impl BuildOutcome {
    /// Parses the three whitespace-separated result words of a build.
    pub fn parse(words: &str) -> Result<Self, HelperError> {
        let mut it = words.split_whitespace();
        match (it.next(), it.next(), it.next(), it.next()) {
            (Some(store), Some(console), Some(protocol), None) => Ok(BuildOutcome {
                store_mfn: store.parse().map_err(|_| HelperError::BuildFailed)?,
                console_mfn: console.parse().map_err(|_| HelperError::BuildFailed)?,
                protocol: protocol.to_string(),
            }),
            _ => Err(HelperError::BuildFailed),
        }
    }
}

/// Result of a domain restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// Machine frame number of the store ring.
    pub store_mfn: u64,
    /// Machine frame number of the console ring.
    pub console_mfn: u64,
}

impl RestoreOutcome {
    /// Parses the two whitespace-separated result words of a restore.
    pub fn parse(words: &str) -> Result<Self, HelperError> {
        let mut it = words.split_whitespace();
        match (it.next(), it.next(), it.next()) {
            (Some(store), Some(console), None) => Ok(RestoreOutcome {
                store_mfn: store.parse().map_err(|_| HelperError::BuildFailed)?,
                console_mfn: console.parse().map_err(|_| HelperError::BuildFailed)?,
            }),
            _ => Err(HelperError::BuildFailed),
        }
    }
}

/// Writes the saved-domain magic at the current position.
pub fn write_save_magic(w: &mut impl Write) -> io::Result<()> {
    w.write_all(SAVE_MAGIC)
}

/// Consumes and verifies the saved-domain magic.
pub fn check_save_magic(r: &mut impl Read) -> Result<(), HelperError> {
    let mut buf = vec![0u8; SAVE_MAGIC.len()];
    r.read_exact(&mut buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            HelperError::BadSignature
        } else {
            HelperError::Io(e)
        }
    })?;
    if buf != SAVE_MAGIC {
        return Err(HelperError::BadSignature);
    }
    Ok(())
}

/// Appends a framed device-model state record.
pub fn write_dm_record(w: &mut impl Write, blob: &[u8]) -> io::Result<()> {
    let len = u32::try_from(blob.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "device-model record too large")
    })?;
    w.write_all(DM_MAGIC)?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(blob)
}

/// Reads a framed device-model state record.
pub fn read_dm_record(r: &mut impl Read) -> Result<Vec<u8>, HelperError> {
    let mut magic = vec![0u8; DM_MAGIC.len()];
    r.read_exact(&mut magic).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            HelperError::BadSignature
        } else {
            HelperError::Io(e)
        }
    })?;
    if magic != DM_MAGIC {
        return Err(HelperError::BadSignature);
    }
    let mut len = [0u8; 4];
    r.read_exact(&mut len)
        .map_err(|_| HelperError::TruncatedDmState)?;
    let len = u32::from_be_bytes(len);
    if len > DM_RECORD_CAP {
        return Err(HelperError::Protocol(format!(
            "device-model record of {} bytes exceeds cap",
            len
        )));
    }
    let mut blob = vec![0u8; len as usize];
    r.read_exact(&mut blob)
        .map_err(|_| HelperError::TruncatedDmState)?;
    Ok(blob)
}

/// Parameters for building or restoring a domain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildSpec {
    /// Hardware-virtualized guest.
    pub hvm: bool,
    /// Maximum memory in KiB.
    pub mem_max_kib: u64,
    /// Initial target memory in KiB.
    pub mem_target_kib: u64,
    /// Kernel image (the HVM loader for HVM guests).
    pub kernel: PathBuf,
    /// Optional initial ramdisk.
    pub ramdisk: Option<PathBuf>,
    /// Kernel command line.
    pub cmdline: String,
    /// VCPU count.
    pub vcpus: u32,
    /// Flavor-specific flags forwarded verbatim (`pae`, `apic`, ...).
    pub flags: Vec<(String, String)>,
}

/// The build/save/restore surface the lifecycle engine drives. `on_ready`
/// in [`DomainBuilder::save`] is called at the `suspend` rendezvous: the
/// engine asks the guest to suspend and waits for it to be gone before the
/// helper is told to carry on.
pub trait DomainBuilder: Send + Sync {
    /// Builds a fresh domain.
    fn build(
        &self,
        task: &TaskHandle,
        domid: DomId,
        spec: &BuildSpec,
    ) -> Result<BuildOutcome, HelperError>;
    /// Saves a running domain into `image` (positioned after the magic).
    fn save(
        &self,
        task: &TaskHandle,
        domid: DomId,
        hvm: bool,
        image: &File,
        on_ready: &mut dyn FnMut() -> Result<(), HelperError>,
    ) -> Result<(), HelperError>;
    /// Restores a domain from `image` (positioned after the magic).
    fn restore(
        &self,
        task: &TaskHandle,
        domid: DomId,
        spec: &BuildSpec,
        image: &File,
    ) -> Result<RestoreOutcome, HelperError>;
}

/// Process-backed [`DomainBuilder`]: spawns the helper binary with only the
/// descriptors it needs.
#[derive(Debug, Clone)]
pub struct HelperProcess {
    binary: PathBuf,
    ctrl_path: PathBuf,
}

impl HelperProcess {
    /// Creates a runner for the helper at `binary`, handing it the
    /// hypervisor control node at `ctrl_path`.
    pub fn new(binary: PathBuf, ctrl_path: PathBuf) -> Self {
        HelperProcess { binary, ctrl_path }
    }

    fn spawn(
        &self,
        mode: &str,
        domid: DomId,
        image: Option<&File>,
        extra: &[String],
    ) -> Result<Child, HelperError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--mode")
            .arg(mode)
            .arg("--domid")
            .arg(domid.to_string())
            .arg("--ctrl")
            .arg(&self.ctrl_path)
            .args(extra)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(image) = image {
            cmd.arg("--image-fd").arg(IMAGE_FD.to_string());
            let fd = image.as_raw_fd();
            // SAFETY: dup2 is async-signal-safe and the slot is reserved
            // for the child; dup2 clears close-on-exec on the copy, so the
            // image is the only descriptor inherited beyond stdio.
            unsafe {
                cmd.pre_exec(move || {
                    if libc::dup2(fd, IMAGE_FD) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        Ok(cmd.spawn()?)
    }

    fn spec_args(spec: &BuildSpec) -> Vec<String> {
        let mut args = vec![
            "--mem-max-kib".into(),
            spec.mem_max_kib.to_string(),
            "--mem-target-kib".into(),
            spec.mem_target_kib.to_string(),
            "--vcpus".into(),
            spec.vcpus.to_string(),
            "--kernel".into(),
            spec.kernel.display().to_string(),
        ];
        if let Some(ramdisk) = &spec.ramdisk {
            args.push("--ramdisk".into());
            args.push(ramdisk.display().to_string());
        }
        if !spec.cmdline.is_empty() {
            args.push("--cmdline".into());
            args.push(spec.cmdline.clone());
        }
        for (key, value) in &spec.flags {
            args.push("--flag".into());
            args.push(format!("{}={}", key, value));
        }
        args
    }

    // Drives a spawned helper to its terminal frame, forwarding debug and
    // progress along the way. Returns the result words.
    fn drive(
        &self,
        task: &TaskHandle,
        mut child: Child,
        mut on_ready: Option<&mut dyn FnMut() -> Result<(), HelperError>>,
    ) -> Result<String, HelperError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HelperError::Protocol("helper has no data channel".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HelperError::Protocol("helper has no debug channel".into()))?;

        let debug_task = task.clone();
        let debug_thread = std::thread::Builder::new()
            .name("helper-debug".into())
            .spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    let Ok(line) = line else { break };
                    match parse_frame(&line) {
                        Ok(Frame::Debug(text)) => debug!("helper: {}", text),
                        Ok(Frame::Progress(percent)) => debug_task.set_progress(percent),
                        Ok(other) => debug!("helper (debug channel): {:?}", other),
                        Err(e) => debug!("helper (debug channel): {}", e),
                    }
                }
            })?;

        let result = (|| {
            for line in BufReader::new(stdout).lines() {
                if task.check_cancel().is_err() {
                    return Err(HelperError::Cancelled);
                }
                match parse_frame(&line?)? {
                    Frame::Debug(text) => debug!("helper: {}", text),
                    Frame::Progress(percent) => task.set_progress(percent),
                    Frame::Suspend => match on_ready.as_mut() {
                        Some(ready) => {
                            ready()?;
                            if let Some(stdin) = child.stdin.as_mut() {
                                stdin.write_all(b"done\n")?;
                                stdin.flush()?;
                            }
                        }
                        None => {
                            return Err(HelperError::Protocol(
                                "unexpected suspend frame".into(),
                            ))
                        }
                    },
                    Frame::Result(words) => return Ok(words),
                    Frame::Error(text) => return Err(HelperError::Reported(text)),
                }
            }
            Err(HelperError::Protocol(
                "helper closed its data channel without a result".into(),
            ))
        })();

        if result.is_err() {
            let _ = child.kill();
        }
        match child.wait() {
            Ok(status) if !status.success() => {
                warn!("builder helper exited with {}", status)
            }
            Err(e) => warn!("failed to reap builder helper: {}", e),
            Ok(_) => (),
        }
        let _ = debug_thread.join();
        result
    }
}

impl DomainBuilder for HelperProcess {
    fn build(
        &self,
        task: &TaskHandle,
        domid: DomId,
        spec: &BuildSpec,
    ) -> Result<BuildOutcome, HelperError> {
        let mode = if spec.hvm { "hvm_build" } else { "build" };
        let child = self.spawn(mode, domid, None, &Self::spec_args(spec))?;
        let words = self.drive(task, child, None)?;
        BuildOutcome::parse(&words)
    }

    fn save(
        &self,
        task: &TaskHandle,
        domid: DomId,
        hvm: bool,
        image: &File,
        on_ready: &mut dyn FnMut() -> Result<(), HelperError>,
    ) -> Result<(), HelperError> {
        let mode = if hvm { "hvm_save" } else { "save" };
        let child = self.spawn(mode, domid, Some(image), &[])?;
        self.drive(task, child, Some(on_ready))?;
        Ok(())
    }

    fn restore(
        &self,
        task: &TaskHandle,
        domid: DomId,
        spec: &BuildSpec,
        image: &File,
    ) -> Result<RestoreOutcome, HelperError> {
        let mode = if spec.hvm { "hvm_restore" } else { "restore" };
        let child = self.spawn(mode, domid, Some(image), &Self::spec_args(spec))?;
        let words = self.drive(task, child, None)?;
        RestoreOutcome::parse(&words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_frames() {
        assert_eq!(
            parse_frame("debug suspending domain 4").unwrap(),
            Frame::Debug("suspending domain 4".into())
        );
        assert_eq!(parse_frame("suspend").unwrap(), Frame::Suspend);
        assert_eq!(
            parse_frame("result 1024 1025 x86_64-abi").unwrap(),
            Frame::Result("1024 1025 x86_64-abi".into())
        );
        assert_eq!(
            parse_frame("error out of memory").unwrap(),
            Frame::Error("out of memory".into())
        );
        assert!(matches!(
            parse_frame("greetings"),
            Err(HelperError::Protocol(_))
        ));
    }

    #[test]
    fn test_progress_frames_clamp_and_strip_redraw() {
        assert_eq!(
            parse_frame("progress \u{8}\u{8}\u{8}\u{8}42%").unwrap(),
            Frame::Progress(42)
        );
        assert_eq!(parse_frame("progress 250").unwrap(), Frame::Progress(100));
        assert!(matches!(
            parse_frame("progress lots"),
            Err(HelperError::Protocol(_))
        ));
    }

    #[test]
    fn test_build_outcome_parse() {
        let outcome = BuildOutcome::parse("1024 1025 x86_32-abi").unwrap();
        assert_eq!(outcome.store_mfn, 1024);
        assert_eq!(outcome.console_mfn, 1025);
        assert_eq!(outcome.protocol, "x86_32-abi");
        assert!(matches!(
            BuildOutcome::parse("1024 1025"),
            Err(HelperError::BuildFailed)
        ));
        assert!(matches!(
            BuildOutcome::parse("a b c"),
            Err(HelperError::BuildFailed)
        ));
    }

    #[test]
    fn test_restore_outcome_parse() {
        let outcome = RestoreOutcome::parse("7 8").unwrap();
        assert_eq!((outcome.store_mfn, outcome.console_mfn), (7, 8));
        assert!(matches!(
            RestoreOutcome::parse("7 8 9"),
            Err(HelperError::BuildFailed)
        ));
    }

    #[test]
    fn test_save_magic_round_trip() {
        let mut image = Vec::new();
        write_save_magic(&mut image).unwrap();
        check_save_magic(&mut Cursor::new(&image)).unwrap();
        assert!(matches!(
            check_save_magic(&mut Cursor::new(b"NotSavedDomain\n")),
            Err(HelperError::BadSignature)
        ));
        assert!(matches!(
            check_save_magic(&mut Cursor::new(b"Xen")),
            Err(HelperError::BadSignature)
        ));
    }

    #[test]
    fn test_dm_record_round_trip() {
        let mut image = Vec::new();
        write_dm_record(&mut image, b"qemu state bytes").unwrap();
        let blob = read_dm_record(&mut Cursor::new(&image)).unwrap();
        assert_eq!(blob, b"qemu state bytes");
    }

    #[test]
    fn test_dm_record_truncated() {
        let mut image = Vec::new();
        write_dm_record(&mut image, b"qemu state bytes").unwrap();
        image.truncate(image.len() - 4);
        assert!(matches!(
            read_dm_record(&mut Cursor::new(&image)),
            Err(HelperError::TruncatedDmState)
        ));
        // Length field itself cut short.
        let short = &image[..DM_MAGIC.len() + 2];
        assert!(matches!(
            read_dm_record(&mut Cursor::new(short)),
            Err(HelperError::TruncatedDmState)
        ));
    }

    #[test]
    fn test_dm_record_bad_magic() {
        assert!(matches!(
            read_dm_record(&mut Cursor::new(b"SomethingElseRecord\n\0\0\0\0")),
            Err(HelperError::BadSignature)
        ));
    }
}

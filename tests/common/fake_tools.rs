//! Simulated external tools for end-to-end workflow tests
//!
//! One launcher stands in for the archiver, the NAND tool, the boot file
//! generator and mount/umount. Each tool leaves behind the files the real one
//! would, so the engine runs unchanged on top of it.
use nandfix::device::{DeviceEnumerator, PhysicalDisk};
use nandfix::tools::{ToolCommand, ToolExit, ToolLauncher, ToolProcess};
use nandfix::{ProgressSink, RecoveryError, RecoveryResult};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const GENERATED_VERSION: &str = "NX-17.0.0_exFAT";
pub const SKELETON_LEN: usize = 3 * 1024 * 1024 + 123;

/// A decrypted PRODINFO carrying `model_code`
pub fn calibration_bytes(model_code: u32) -> Vec<u8> {
    let mut data = vec![0u8; 0x8000];
    data[..4].copy_from_slice(b"CAL0");
    data[0x3740..0x3744].copy_from_slice(&model_code.to_le_bytes());
    data
}

pub fn skeleton_bytes() -> Vec<u8> {
    (0..SKELETON_LEN).map(|i| (i % 253) as u8).collect()
}

/// Knobs for failure scenarios
#[derive(Debug, Clone)]
pub struct Behaviour {
    /// Model code written into dumped PRODINFO
    pub model_code: u32,
    pub prodinfo_dump_fails: bool,
    /// Partition whose flash exits non-zero
    pub failing_flash: Option<String>,
    /// Partition whose flash raises the interrupt flag, as Ctrl+C would
    pub interrupt_on_flash: Option<String>,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            model_code: 1,
            prodinfo_dump_fails: false,
            failing_flash: None,
            interrupt_on_flash: None,
        }
    }
}

/// Files found in a mounted image when it was unmounted
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub image: PathBuf,
    pub files: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct FakeTools {
    behaviour: Behaviour,
    commands: Arc<Mutex<Vec<ToolCommand>>>,
    snapshots: Arc<Mutex<Vec<Snapshot>>>,
    mounted: Arc<Mutex<HashMap<PathBuf, PathBuf>>>,
    terminations: Arc<AtomicUsize>,
}

struct Outcome {
    lines: Vec<String>,
    exit_code: i32,
}

impl Outcome {
    fn ok<S: Into<String>>(lines: impl IntoIterator<Item = S>) -> Self {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            exit_code: 0,
        }
    }

    fn fail(message: &str) -> Self {
        Self {
            lines: vec![message.to_string()],
            exit_code: 1,
        }
    }
}

fn arg(cmd: &ToolCommand, index: usize) -> PathBuf {
    PathBuf::from(&cmd.args[index])
}

fn part_name(cmd: &ToolCommand) -> String {
    cmd.args
        .iter()
        .find_map(|a| a.to_str().and_then(|s| s.strip_prefix("-part=")))
        .unwrap_or_default()
        .to_string()
}

fn write_file(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

fn collect_files(root: &Path, dir: &Path, files: &mut BTreeMap<String, String>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect_files(root, &path, files);
        } else {
            let relative = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
            let contents = String::from_utf8_lossy(&fs::read(&path).unwrap()).into_owned();
            files.insert(relative, contents);
        }
    }
}

impl FakeTools {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            commands: Arc::new(Mutex::new(Vec::new())),
            snapshots: Arc::new(Mutex::new(Vec::new())),
            mounted: Arc::new(Mutex::new(HashMap::new())),
            terminations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn commands(&self) -> Vec<ToolCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn commands_for(&self, program: &str) -> Vec<ToolCommand> {
        self.commands()
            .into_iter()
            .filter(|c| c.program_name() == program)
            .collect()
    }

    /// NAND tool invocations that write a partition
    pub fn flashes(&self) -> Vec<ToolCommand> {
        self.commands_for("NxNandManager")
            .into_iter()
            .filter(|c| c.has_arg("FORCE"))
            .collect()
    }

    pub fn flashed_partitions(&self) -> Vec<String> {
        self.flashes().iter().map(part_name).collect()
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    fn archiver(&self, cmd: &ToolCommand) -> Outcome {
        let archive = arg(cmd, 1);
        let out = PathBuf::from(
            cmd.args[2]
                .to_string_lossy()
                .trim_start_matches("-o")
                .to_string(),
        );
        let name = archive.file_name().unwrap().to_string_lossy().into_owned();

        match name.as_str() {
            "donor32.7z" => write_file(&out.join("rawnand32.bin"), &skeleton_bytes()),
            "donor64.7z" => write_file(&out.join("rawnand64.bin"), &skeleton_bytes()),
            "USER-32.7z" | "USER-64.7z" => write_file(&out.join("USER.dec"), name.as_bytes()),
            other => {
                let stem = other.trim_end_matches(".7z");
                write_file(&out.join(format!("{}.dec", stem)), b"donor image");
            }
        }

        Outcome::ok([
            "7-Zip (a) 23.01 (x64)".to_string(),
            "  0%".to_string(),
            format!(" 45% 1 - {}", name),
            "100%".to_string(),
            "Everything is Ok".to_string(),
        ])
    }

    fn dump(&self, cmd: &ToolCommand) -> Outcome {
        let out = arg(cmd, 5);
        let part = part_name(cmd);

        if part == "PRODINFO" {
            if self.behaviour.prodinfo_dump_fails {
                return Outcome::fail("ERROR: Failed to decrypt PRODINFO (bad crypto)");
            }
            write_file(&out.join("PRODINFO"), &calibration_bytes(self.behaviour.model_code));
        } else {
            write_file(&out.join(&part), b"device image");
        }
        Outcome::ok([format!("Dumping {}... done", part)])
    }

    fn flash(&self, cmd: &ToolCommand) -> Outcome {
        let part = part_name(cmd);
        if self.behaviour.failing_flash.as_deref() == Some(part.as_str()) {
            return Outcome::fail("ERROR: Failed to write partition");
        }
        if self.behaviour.interrupt_on_flash.as_deref() == Some(part.as_str()) {
            nandfix::set_interrupted();
        }

        if part == "USER" {
            return Outcome::ok(
                (0..=60).map(|i| format!("Restoring to USER... {:.2} MB", i as f64 * 4.0)),
            );
        }
        Outcome::ok([
            format!("Restoring to {}... 1.00 MB", part),
            format!("Restoring to {}... done", part),
        ])
    }

    fn generator(&self, cmd: &ToolCommand) -> Outcome {
        let version = cmd.cwd.clone().unwrap().join(GENERATED_VERSION);
        let system = version.join("SYSTEM");
        write_file(&system.join("Contents/registered/new.nca"), b"generated");
        write_file(&system.join("save/8000000000000120"), b"generated-save");
        write_file(&system.join("save/8000000000000000"), b"generated-system-save");
        for package in [
            "BCPKG2-1-Normal-Main",
            "BCPKG2-2-Normal-Sub",
            "BCPKG2-3-SafeMode-Main",
            "BCPKG2-4-SafeMode-Sub",
        ] {
            write_file(&version.join(format!("{}.bin", package)), b"pkg2");
        }
        write_file(&version.join("BOOT0.bin"), b"boot0");
        write_file(&version.join("BOOT1.bin"), b"boot1");
        Outcome::ok(["EmmcHaccGen 2.4", "Done!"])
    }

    fn mount(&self, cmd: &ToolCommand) -> Outcome {
        let image = arg(cmd, 2);
        let target = arg(cmd, 3);

        // What an existing SYSTEM partition already holds
        write_file(&target.join("Contents/registered/old.nca"), b"old");
        write_file(&target.join("Contents/placehld/keep.bin"), b"keep");
        write_file(&target.join("save/8000000000000120"), b"device-save");
        self.mounted.lock().unwrap().insert(target, image);
        Outcome::ok(Vec::<String>::new())
    }

    fn unmount(&self, cmd: &ToolCommand) -> Outcome {
        let target = arg(cmd, 0);
        let image = match self.mounted.lock().unwrap().remove(&target) {
            Some(image) => image,
            None => return Outcome::fail("umount: not mounted"),
        };

        let mut files = BTreeMap::new();
        collect_files(&target, &target, &mut files);
        self.snapshots.lock().unwrap().push(Snapshot { image, files });
        fs::remove_dir_all(&target).unwrap();
        Outcome::ok(Vec::<String>::new())
    }
}

impl ToolLauncher for FakeTools {
    fn launch(&self, cmd: &ToolCommand) -> RecoveryResult<Box<dyn ToolProcess>> {
        self.commands.lock().unwrap().push(cmd.clone());

        let outcome = match cmd.program_name().as_str() {
            "7z" => self.archiver(cmd),
            "NxNandManager" if cmd.has_arg("-d") => self.dump(cmd),
            "NxNandManager" => self.flash(cmd),
            "EmmcHaccGen" => self.generator(cmd),
            "mount" => self.mount(cmd),
            "umount" => self.unmount(cmd),
            other => {
                return Err(RecoveryError::DependencyUnavailable(format!(
                    "no fake for {}",
                    other
                )))
            }
        };

        Ok(Box::new(FakeProcess {
            lines: outcome.lines.into(),
            exit_code: outcome.exit_code,
            terminated: false,
            terminations: Arc::clone(&self.terminations),
        }))
    }
}

struct FakeProcess {
    lines: VecDeque<String>,
    exit_code: i32,
    terminated: bool,
    terminations: Arc<AtomicUsize>,
}

impl ToolProcess for FakeProcess {
    fn next_line(&mut self) -> Option<String> {
        if self.terminated {
            return None;
        }
        self.lines.pop_front()
    }

    fn terminate(&mut self) -> RecoveryResult<()> {
        self.terminated = true;
        self.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn wait(&mut self) -> RecoveryResult<ToolExit> {
        let code = if self.terminated {
            None
        } else {
            Some(self.exit_code)
        };
        Ok(ToolExit { code })
    }
}

/// Fixed set of physical disks
pub struct StaticDisks(pub Vec<PhysicalDisk>);

impl DeviceEnumerator for StaticDisks {
    fn physical_disks(&self) -> RecoveryResult<Vec<PhysicalDisk>> {
        Ok(self.0.clone())
    }
}

/// Sink that keeps everything for assertions
#[derive(Default)]
pub struct RecordingSink {
    pub lines: Mutex<Vec<String>>,
    pub progress: Mutex<Vec<(String, u8)>>,
    pub steps: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn steps(&self) -> Vec<String> {
        self.steps.lock().unwrap().clone()
    }

    pub fn saw_line(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

impl ProgressSink for RecordingSink {
    fn line(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }

    fn progress(&self, task: &str, percent: u8) {
        self.progress.lock().unwrap().push((task.to_string(), percent));
    }

    fn step_started(&self, _index: usize, _total: usize, description: &str) {
        self.steps.lock().unwrap().push(description.to_string());
    }
}

//! Subprocess adapter for a SNAPHU-compatible statistical-cost unwrapper.
//!
//! Inputs are exchanged as native-endian float32 row-major rasters in a
//! private temporary directory, configured through a `KEY value` parameter
//! file passed with `-f`.

use crate::core::phase_unwrap::{CostMode, InitMethod, PhaseUnwrapper, UnwrapMethod};
use crate::types::{ensure_same_shape, InsarError, InsarResult, SarRealImage};
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Parameters written to the unwrapper's configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnaphuConfig {
    pub init_method: InitMethod,
    pub n_tile_row: usize,
    pub n_tile_col: usize,
    pub row_overlap: usize,
    pub col_overlap: usize,
    /// Deformation-cycle cap
    pub defo_max_cycle: f64,
    pub defo_thresh_factor: f64,
    pub verbose: bool,
}

impl Default for SnaphuConfig {
    fn default() -> Self {
        Self {
            init_method: InitMethod::Mcf,
            n_tile_row: 1,
            n_tile_col: 1,
            row_overlap: 0,
            col_overlap: 0,
            defo_max_cycle: 1.2,
            defo_thresh_factor: 4.0,
            verbose: true,
        }
    }
}

impl SnaphuConfig {
    /// Split large rasters into `n_row x n_col` tiles with the given overlaps
    pub fn with_tiles(mut self, n_row: usize, n_col: usize, row_overlap: usize, col_overlap: usize) -> Self {
        self.n_tile_row = n_row.max(1);
        self.n_tile_col = n_col.max(1);
        self.row_overlap = row_overlap;
        self.col_overlap = col_overlap;
        self
    }

    /// Render the parameter file for one invocation
    pub fn render(&self, files: &SnaphuFiles, line_length: usize, cost_mode: CostMode) -> String {
        let mut entries: Vec<(&str, String)> = vec![
            ("INFILE", files.wrapped.display().to_string()),
            ("LINELENGTH", line_length.to_string()),
            ("OUTFILE", files.unwrapped.display().to_string()),
            ("CORRFILE", files.coherence.display().to_string()),
            ("STATCOSTMODE", cost_mode.to_string()),
            ("INITMETHOD", self.init_method.to_string()),
            ("NTILEROW", self.n_tile_row.to_string()),
            ("NTILECOL", self.n_tile_col.to_string()),
        ];
        if self.row_overlap > 0 {
            entries.push(("ROWOVRLP", self.row_overlap.to_string()));
        }
        if self.col_overlap > 0 {
            entries.push(("COLOVRLP", self.col_overlap.to_string()));
        }
        entries.push(("DEFOMAX_CYCLE", self.defo_max_cycle.to_string()));
        entries.push(("DEFOTHRESHFACTOR", self.defo_thresh_factor.to_string()));
        if self.verbose {
            entries.push(("VERBOSE", "TRUE".to_string()));
        }
        entries.push(("LOGFILE", files.log.display().to_string()));

        entries
            .into_iter()
            .map(|(key, value)| format!("{} {}\n", key, value))
            .collect()
    }
}

/// File layout of one invocation's work directory
#[derive(Debug, Clone)]
pub struct SnaphuFiles {
    pub wrapped: PathBuf,
    pub coherence: PathBuf,
    pub unwrapped: PathBuf,
    pub config: PathBuf,
    pub log: PathBuf,
}

impl SnaphuFiles {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            wrapped: dir.join("wrapped_phase.bin"),
            coherence: dir.join("coherence.bin"),
            unwrapped: dir.join("unwrapped_phase.bin"),
            config: dir.join("snaphu.conf"),
            log: dir.join("snaphu.log"),
        }
    }
}

/// External unwrapper run as an isolated, timeout-bounded subprocess
pub struct SnaphuUnwrapper {
    executable: PathBuf,
    timeout: Duration,
    config: SnaphuConfig,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl SnaphuUnwrapper {
    pub fn new<P: Into<PathBuf>>(executable: P, timeout: Duration, config: SnaphuConfig) -> Self {
        Self {
            executable: executable.into(),
            timeout,
            config,
            cancel_flag: None,
        }
    }

    /// `snaphu` from `PATH`, one-hour timeout
    pub fn standard() -> Self {
        Self::new("snaphu", Duration::from_secs(3600), SnaphuConfig::default())
    }

    /// Kill the subprocess as soon as `flag` is raised
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(flag);
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Whether the executable can be located without running it
    pub fn is_available(&self) -> bool {
        if self.executable.components().count() > 1 {
            return self.executable.is_file();
        }
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(&self.executable).is_file()))
            .unwrap_or(false)
    }

    fn run(
        &self,
        wrapped_phase: &SarRealImage,
        coherence: &SarRealImage,
        cost_mode: CostMode,
    ) -> InsarResult<SarRealImage> {
        let (rows, cols) = wrapped_phase.dim();
        let work_dir = tempfile::Builder::new().prefix("snaphu").tempdir()?;
        let files = SnaphuFiles::in_dir(work_dir.path());

        write_f32_raster(&files.wrapped, wrapped_phase)?;
        write_f32_raster(&files.coherence, coherence)?;
        std::fs::write(&files.config, self.config.render(&files, cols, cost_mode))?;
        log::debug!("Unwrapper parameter file written to {}", files.config.display());

        let stderr_log = File::create(work_dir.path().join("stderr.log"))?;
        let mut child = Command::new(&self.executable)
            .arg("-f")
            .arg(&files.config)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_log))
            .spawn()
            .map_err(|e| {
                InsarError::ExternalToolFailure(format!(
                    "cannot start {}: {}",
                    self.executable.display(),
                    e
                ))
            })?;
        log::info!("Started external unwrapper {} (pid {})", self.executable.display(), child.id());

        let status = self.wait(&mut child)?;
        if !status.success() {
            let stderr = std::fs::read_to_string(work_dir.path().join("stderr.log")).unwrap_or_default();
            return Err(InsarError::ExternalToolFailure(format!(
                "{} exited with {}: {}",
                self.executable.display(),
                status,
                stderr.trim()
            )));
        }

        read_f32_raster(&files.unwrapped, rows, cols)
    }

    fn wait(&self, child: &mut Child) -> InsarResult<ExitStatus> {
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if self
                .cancel_flag
                .as_ref()
                .map(|flag| flag.load(Ordering::Relaxed))
                .unwrap_or(false)
            {
                terminate(child);
                return Err(InsarError::Cancelled);
            }
            if started.elapsed() >= self.timeout {
                terminate(child);
                return Err(InsarError::ExternalToolFailure(format!(
                    "{} timed out after {:?}",
                    self.executable.display(),
                    self.timeout
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl PhaseUnwrapper for SnaphuUnwrapper {
    fn method(&self) -> UnwrapMethod {
        UnwrapMethod::External
    }

    fn unwrap_phase(
        &self,
        wrapped_phase: &SarRealImage,
        coherence: &SarRealImage,
        cost_mode: CostMode,
    ) -> InsarResult<SarRealImage> {
        ensure_same_shape("external unwrap phase/coherence", wrapped_phase, coherence)?;
        self.run(wrapped_phase, coherence, cost_mode)
    }
}

fn terminate(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::debug!("Failed to kill unwrapper subprocess: {}", e);
    }
    if let Err(e) = child.wait() {
        log::debug!("Failed to reap unwrapper subprocess: {}", e);
    }
}

/// Write a raster as native-endian float32, row-major
pub fn write_f32_raster(path: &Path, data: &SarRealImage) -> InsarResult<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for &v in data.iter() {
        writer.write_f32::<NativeEndian>(v)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a native-endian float32 row-major raster of known shape
pub fn read_f32_raster(path: &Path, rows: usize, cols: usize) -> InsarResult<SarRealImage> {
    let file = File::open(path).map_err(|e| {
        InsarError::ExternalToolFailure(format!("missing output {}: {}", path.display(), e))
    })?;
    let expected = (rows * cols * std::mem::size_of::<f32>()) as u64;
    let actual = file.metadata()?.len();
    if actual != expected {
        return Err(InsarError::ExternalToolFailure(format!(
            "output {} holds {} bytes, expected {}",
            path.display(),
            actual,
            expected
        )));
    }

    let mut values = vec![0.0f32; rows * cols];
    BufReader::new(file).read_f32_into::<NativeEndian>(&mut values)?;
    SarRealImage::from_shape_vec((rows, cols), values)
        .map_err(|e| InsarError::ShapeMismatch(format!("unwrapper output: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_terminate_kills_and_reaps() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        terminate(&mut child);
        assert!(child.try_wait().unwrap().is_some());
        // A second call on a reaped child only logs
        terminate(&mut child);
    }

    #[test]
    fn test_parameter_file_contents() {
        let files = SnaphuFiles::in_dir(Path::new("/work"));
        let config = SnaphuConfig::default().with_tiles(2, 3, 200, 150);
        let text = config.render(&files, 512, CostMode::Smooth);

        assert!(text.contains("INFILE /work/wrapped_phase.bin\n"));
        assert!(text.contains("LINELENGTH 512\n"));
        assert!(text.contains("CORRFILE /work/coherence.bin\n"));
        assert!(text.contains("STATCOSTMODE SMOOTH\n"));
        assert!(text.contains("INITMETHOD MCF\n"));
        assert!(text.contains("NTILEROW 2\n"));
        assert!(text.contains("NTILECOL 3\n"));
        assert!(text.contains("ROWOVRLP 200\n"));
        assert!(text.contains("COLOVRLP 150\n"));
        assert!(text.contains("DEFOMAX_CYCLE 1.2\n"));
    }

    #[test]
    fn test_overlaps_omitted_when_untiled() {
        let files = SnaphuFiles::in_dir(Path::new("/work"));
        let text = SnaphuConfig::default().render(&files, 8, CostMode::Defo);
        assert!(!text.contains("ROWOVRLP"));
        assert!(!text.contains("COLOVRLP"));
    }

    #[test]
    fn test_raster_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raster.bin");
        let data = SarRealImage::from_shape_fn((3, 5), |(i, j)| i as f32 * 10.0 - j as f32);

        write_f32_raster(&path, &data).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 60);
        assert_eq!(read_f32_raster(&path, 3, 5).unwrap(), data);
    }

    #[test]
    fn test_short_output_is_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, [0u8; 10]).unwrap();
        let err = read_f32_raster(&path, 2, 2).unwrap_err();
        assert!(matches!(err, InsarError::ExternalToolFailure(_)));
    }

    #[test]
    fn test_missing_executable_is_tool_failure() {
        let unwrapper = SnaphuUnwrapper::new(
            "/nonexistent/snaphu-binary",
            Duration::from_secs(1),
            SnaphuConfig::default(),
        );
        assert!(!unwrapper.is_available());

        let phase = SarRealImage::zeros((2, 2));
        let err = unwrapper.unwrap_phase(&phase, &phase, CostMode::Defo).unwrap_err();
        assert!(matches!(err, InsarError::ExternalToolFailure(_)));
    }
}

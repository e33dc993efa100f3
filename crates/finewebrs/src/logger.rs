use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

/// Append-only metrics log, written by the master process only.
///
/// One line per record: `"{step} train {loss}"`, `"{step} val {loss}"` or
/// `"{step} hella {acc}"`.
pub struct Logger {
    active: bool,
    output_log_file: PathBuf,
}

impl Logger {
    pub fn init(log_dir: &Path, is_master: bool) -> io::Result<Self> {
        let mut logger = Logger { active: false, output_log_file: PathBuf::new() };

        if is_master {
            fs::create_dir_all(log_dir)?;
            logger.active = true;
            logger.output_log_file = log_dir.join("log.txt");
            // start from an empty log every run
            File::create(&logger.output_log_file)?;
        }
        Ok(logger)
    }

    pub fn path(&self) -> Option<&Path> {
        self.active.then_some(self.output_log_file.as_path())
    }

    fn append(&self, line: std::fmt::Arguments<'_>) -> io::Result<()> {
        if !self.active { return Ok(()); }
        let mut f = OpenOptions::new().create(true).append(true).open(&self.output_log_file)?;
        f.write_fmt(line)?;
        f.write_all(b"\n")
    }

    #[inline]
    pub fn log_train(&self, step: usize, train_loss: f32) -> io::Result<()> {
        self.append(format_args!("{} train {:.6}", step, train_loss))
    }

    #[inline]
    pub fn log_val(&self, step: usize, val_loss: f32) -> io::Result<()> {
        self.append(format_args!("{} val {:.4}", step, val_loss))
    }

    #[inline]
    pub fn log_eval(&self, step: usize, acc_norm: f32) -> io::Result<()> {
        self.append(format_args!("{} hella {:.4}", step, acc_norm))
    }
}

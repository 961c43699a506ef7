use clap::Args;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

/// Where a non-tracked run writes its log and result row.
#[derive(Debug, Clone, Args)]
pub struct OutputArgs {
    /// CSV file the result row is appended to (created if missing).
    #[arg(long, default_value = "results/urbancars_lrmix.csv")]
    pub results_csv: PathBuf,
    /// Log file for the run; existing files are overwritten after confirmation.
    #[arg(long, default_value = "urbancars_lrmix.out")]
    pub stdout_file: PathBuf,
    /// Overwrite an existing log file without asking.
    #[arg(long, default_value_t = false)]
    pub yes: bool,
}

/// Local experiment-tracking sink (JSON lines per run).
#[derive(Debug, Clone, Args)]
pub struct TrackingArgs {
    /// Stream configuration, epoch metrics and results to the tracking sink instead of CSV.
    #[arg(long, default_value_t = false)]
    pub track: bool,
    /// Tracking project name (subdirectory of --tracking-dir).
    #[arg(long, default_value = "spuco")]
    pub tracking_project: String,
    /// Optional entity recorded with the run configuration.
    #[arg(long)]
    pub tracking_entity: Option<String>,
    /// Run name; also the JSON-lines file name.
    #[arg(long, default_value = "urbancars_lrmix")]
    pub tracking_run_name: String,
    /// Root directory of the tracking sink.
    #[arg(long, default_value = "runs")]
    pub tracking_dir: PathBuf,
}

impl TrackingArgs {
    /// JSON-lines file of this run: `<dir>/<project>/<run_name>.jsonl`.
    pub fn run_path(&self) -> PathBuf {
        self.tracking_dir
            .join(&self.tracking_project)
            .join(format!("{}.jsonl", self.tracking_run_name))
    }
}

/// Ask before overwriting `path`. Returns `true` when it is fine to proceed:
/// the file does not exist, `assume_yes` is set, or the answer starts with `y`.
pub fn confirm_overwrite<R: BufRead, W: Write>(
    path: &Path,
    assume_yes: bool,
    input: &mut R,
    output: &mut W,
) -> std::io::Result<bool> {
    if !path.exists() || assume_yes {
        return Ok(true);
    }
    write!(
        output,
        "{} already exists; overwrite? [y/N] ",
        path.display()
    )?;
    output.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn run_path_layout() {
        let args = TrackingArgs {
            track: true,
            tracking_project: "proj".into(),
            tracking_entity: None,
            tracking_run_name: "a".into(),
            tracking_dir: PathBuf::from("runs"),
        };
        assert_eq!(args.run_path(), PathBuf::from("runs/proj/a.jsonl"));
    }

    #[test]
    fn missing_file_needs_no_prompt() {
        let mut input = Cursor::new(Vec::new());
        let mut out = Vec::new();
        let ok = confirm_overwrite(Path::new("/definitely/not/here.log"), false, &mut input, &mut out)
            .unwrap();
        assert!(ok);
        assert!(out.is_empty());
    }
}

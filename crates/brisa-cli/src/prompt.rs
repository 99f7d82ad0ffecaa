//! Terminal resolution of captchas that need a human.

use std::path::{Path, PathBuf};

use brisa::{ManualHandle, PendingChallenge};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// Write the challenge image to `dir` and return its path.
pub fn save_challenge(dir: &Path, bytes: &[u8], extension: &str, attempt: u32) -> std::io::Result<PathBuf> {
    let path = dir.join(format!("brisa-captcha-{}-{attempt}.{extension}", std::process::id()));
    std::fs::write(&path, bytes)?;
    Ok(path)
}

/// Turn a typed line into a solution; blank means "give up".
pub fn solution_from_line(line: &str) -> Option<String> {
    let trimmed = line.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn read_solution() -> Result<Option<String>, ReadlineError> {
    let mut editor = DefaultEditor::new()?;
    match editor.readline("captcha> ") {
        Ok(line) => Ok(solution_from_line(&line)),
        Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => Ok(None),
        Err(e) => Err(e),
    }
}

async fn ask(pending: PendingChallenge) {
    let path = match save_challenge(
        &std::env::temp_dir(),
        pending.image_bytes(),
        pending.challenge().image_extension(),
        pending.attempt(),
    ) {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(error = %e, "cannot save captcha image");
            pending.abort();
            return;
        }
    };

    eprintln!();
    eprintln!("Captcha (attempt {}): open {}", pending.attempt(), path.display());
    eprintln!("Type the characters shown and press Enter (empty line aborts).");

    let answer = tokio::task::spawn_blocking(read_solution).await;
    let _ = std::fs::remove_file(&path);

    match answer {
        Ok(Ok(Some(solution))) => pending.resolve_manual(solution),
        Ok(Ok(None)) => pending.abort(),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "cannot read from terminal");
            pending.abort();
        }
        Err(e) => {
            tracing::error!(error = %e, "prompt task failed");
            pending.abort();
        }
    }
}

/// Answer challenges from the terminal until the retrieval ends.
pub async fn answer_challenges(mut handle: ManualHandle) {
    while let Some(pending) = handle.await_manual_solution().await {
        ask(pending).await;
    }
}

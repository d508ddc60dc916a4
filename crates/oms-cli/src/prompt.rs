//! Interactive passphrase prompt for encrypted SSH keys.

use std::path::Path;

use anyhow::Context;
use dialoguer::Password;
use dialoguer::theme::ColorfulTheme;
use tokio::runtime::{Handle, RuntimeFlavor};
use zeroize::Zeroizing;

use oms_core::remote::PassphraseProvider;

#[derive(Debug, Default)]
pub struct TerminalPassphrase;

impl PassphraseProvider for TerminalPassphrase {
    fn passphrase(&self, key_path: &Path) -> anyhow::Result<Zeroizing<String>> {
        if !console::user_attended() {
            anyhow::bail!(
                "{} is encrypted; load it into ssh-agent or run interactively",
                key_path.display()
            );
        }
        let prompt = format!("Passphrase for {}", key_path.display());
        let passphrase = off_worker(|| {
            Password::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .allow_empty_password(true)
                .interact()
        })
        .context("Failed to read passphrase")?;
        Ok(Zeroizing::new(passphrase))
    }
}

/// Run a blocking terminal read without stalling other tasks on this worker.
fn off_worker<T>(read: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(read)
        }
        _ => read(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_read_leaves_other_tasks_running() {
        let ticker = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            "ticked"
        });

        let value = off_worker(|| {
            std::thread::sleep(Duration::from_millis(50));
            42
        });

        assert_eq!(value, 42);
        assert_eq!(ticker.await.unwrap(), "ticked");
    }

    #[tokio::test]
    async fn current_thread_runtime_reads_inline() {
        assert_eq!(off_worker(|| "inline"), "inline");
    }

    #[test]
    fn works_outside_a_runtime() {
        assert_eq!(off_worker(|| 7), 7);
    }
}

//! Agent command lines.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use tasklane_core::config::AgentConfig;

/// Arguments for a direct agent run, in order:
/// `<base_args…> --model <model> --output-format stream-json --verbose
/// <extra_args…> -p <prompt>`.
pub fn agent_args(agent: &AgentConfig, model: &str, prompt: &str) -> Vec<String> {
    let mut args = agent.base_args.clone();
    args.extend(
        [
            "--model",
            model,
            "--output-format",
            "stream-json",
            "--verbose",
        ]
        .map(String::from),
    );
    args.extend(agent.extra_args.iter().cloned());
    args.push("-p".to_string());
    args.push(prompt.to_string());
    args
}

/// Build the direct agent command. The child leads its own process group.
pub fn agent_command(
    agent: &AgentConfig,
    model: &str,
    prompt: &str,
    working_directory: Option<&Path>,
) -> Command {
    let mut cmd = Command::new(&agent.binary);
    cmd.args(agent_args(agent, model, prompt))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = working_directory {
        cmd.current_dir(dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Build the companion orchestrator command:
/// `<companion_bin> <companion_args…> --agent <agent_bin>`.
pub fn companion_command(binary: &Path, args: &[String], agent_binary: &Path) -> Command {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .arg("--agent")
        .arg(agent_binary)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_args_order() {
        let agent = AgentConfig {
            base_args: vec!["wrapper.sh".into()],
            extra_args: vec!["--max-turns".into(), "20".into()],
            ..AgentConfig::default()
        };
        let args = agent_args(&agent, "opus", "Fix the build");
        assert_eq!(
            args,
            vec![
                "wrapper.sh",
                "--model",
                "opus",
                "--output-format",
                "stream-json",
                "--verbose",
                "--max-turns",
                "20",
                "-p",
                "Fix the build",
            ]
        );
    }

    #[test]
    fn prompt_is_a_single_argument() {
        let args = agent_args(&AgentConfig::default(), "m", "two words; rm -rf /");
        assert_eq!(args.last().map(String::as_str), Some("two words; rm -rf /"));
    }
}

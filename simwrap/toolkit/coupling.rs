use std::{
    fs,
    path::Path,
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use regex::Regex;
use tracing::debug;

use crate::error::ToolkitError;

/// Replaces every token in `template` with the matching value.
///
/// Tokens are substituted longest first so that `@F` never clobbers `@FX`.
pub fn render_str(template: &str, tokens: &[&str], values: &[f64]) -> Result<String, ToolkitError> {
    substitute(template, "<inline>", tokens, values)
}

/// Renders the template file into `output`.
pub fn render_template(
    template: impl AsRef<Path>,
    output: impl AsRef<Path>,
    tokens: &[&str],
    values: &[f64],
) -> Result<(), ToolkitError> {
    let template = template.as_ref();
    let output = output.as_ref();
    let raw = fs::read_to_string(template)
        .map_err(|err| ToolkitError::io(format!("reading template {}", template.display()), err))?;
    let rendered = substitute(&raw, &template.display().to_string(), tokens, values)?;
    fs::write(output, rendered)
        .map_err(|err| ToolkitError::io(format!("writing {}", output.display()), err))
}

fn substitute(
    template: &str,
    label: &str,
    tokens: &[&str],
    values: &[f64],
) -> Result<String, ToolkitError> {
    if tokens.len() != values.len() {
        return Err(ToolkitError::TokenCount {
            expected: tokens.len(),
            actual: values.len(),
        });
    }
    let mut pairs: Vec<(&str, f64)> = tokens.iter().copied().zip(values.iter().copied()).collect();
    pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    let mut rendered = template.to_owned();
    for (token, value) in pairs {
        if !rendered.contains(token) {
            return Err(ToolkitError::MissingToken {
                template: label.to_owned(),
                token: token.to_owned(),
            });
        }
        rendered = rendered.replace(token, &value.to_string());
    }
    Ok(rendered)
}

/// Runs `command` through the platform shell inside `cwd` and returns the
/// wall time it took.
pub fn execute(command: &str, cwd: impl AsRef<Path>) -> Result<Duration, ToolkitError> {
    let cwd = cwd.as_ref();
    let mut cmd = shell(command);
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let started = Instant::now();
    let output = cmd
        .output()
        .map_err(|err| ToolkitError::io(format!("spawning `{command}`"), err))?;
    let elapsed = started.elapsed();
    if !output.status.success() {
        return Err(ToolkitError::CommandFailed {
            command: command.to_owned(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    debug!(command, cwd = %cwd.display(), elapsed_ms = elapsed.as_millis(), "command finished");
    Ok(elapsed)
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Reads the numeric `attribute` of the first `<element>` in an XML file.
pub fn read_xml_attribute(
    path: impl AsRef<Path>,
    element: &str,
    attribute: &str,
) -> Result<f64, ToolkitError> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .map_err(|err| ToolkitError::io(format!("reading {}", path.display()), err))?;
    let missing = || ToolkitError::MissingAttribute {
        path: path.to_path_buf(),
        element: element.to_owned(),
        attribute: attribute.to_owned(),
    };
    let pattern = format!(
        r#"<{}\b[^>]*?\b{}\s*=\s*["']([^"']*)["']"#,
        regex::escape(element),
        regex::escape(attribute)
    );
    let re = Regex::new(&pattern).map_err(|_| missing())?;
    let captured = re
        .captures(&raw)
        .and_then(|caps| caps.get(1))
        .ok_or_else(missing)?
        .as_str()
        .trim();
    captured
        .parse::<f64>()
        .map_err(|_| ToolkitError::InvalidNumber {
            path: path.to_path_buf(),
            raw: captured.to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn renders_longest_token_first() {
        let rendered = render_str("F=@F FX=@FX", &["@F", "@FX"], &[1.5, 2.0]).unwrap();
        assert_eq!(rendered, "F=1.5 FX=2");
    }

    #[test]
    fn missing_token_and_count_are_errors() {
        assert!(matches!(
            render_str("@F", &["@F", "@E"], &[1.0, 2.0]),
            Err(ToolkitError::MissingToken { token, .. }) if token == "@E"
        ));
        assert!(matches!(
            render_str("@F", &["@F"], &[]),
            Err(ToolkitError::TokenCount { expected: 1, actual: 0 })
        ));
    }

    #[test]
    fn renders_template_file() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("input_template.xml");
        fs::write(&template, r#"<beam load="@F" length="@L"/>"#).unwrap();
        let out = dir.path().join("beam.xml");
        render_template(&template, &out, &["@F", "@L"], &[30000.0, 2.5]).unwrap();
        assert_eq!(
            fs::read_to_string(out).unwrap(),
            r#"<beam load="30000" length="2.5"/>"#
        );
    }

    #[test]
    fn parses_xml_attribute() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("_outputs_.xml");
        fs::write(
            &path,
            "<?xml version=\"1.0\"?>\n<root>\n  <outputs runtime='0.1' deviation=\"12.5e-2\" />\n</root>",
        )
        .unwrap();
        assert!((read_xml_attribute(&path, "outputs", "deviation").unwrap() - 0.125).abs() < 1e-12);
        assert!(matches!(
            read_xml_attribute(&path, "outputs", "stress"),
            Err(ToolkitError::MissingAttribute { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn execute_runs_in_directory_and_reports_failures() {
        let dir = tempdir().unwrap();
        execute("echo done > marker.txt", dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("marker.txt")).unwrap().trim(),
            "done"
        );
        let err = execute("echo broken >&2; exit 3", dir.path()).unwrap_err();
        match err {
            ToolkitError::CommandFailed { stderr, status, .. } => {
                assert_eq!(stderr, "broken");
                assert!(status.contains('3'));
            }
            other => panic!("unexpected error {other}"),
        }
    }
}

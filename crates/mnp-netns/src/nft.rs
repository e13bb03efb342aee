//! nft command invocation and script assembly

use std::process::{Command, Stdio};

use mnp_core::{Error, Result};

/// Execute an nftables command
pub fn run_command(args: &[&str]) -> Result<String> {
    tracing::debug!("Executing nft command: {:?}", args);

    let output = Command::new("nft")
        .args(args)
        .output()
        .map_err(|e| Error::PacketFilter(format!("Failed to execute nft command: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::PacketFilter(format!("nft command failed: {}", stderr)));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Execute an nftables script via `nft -f -`. The whole script is one kernel
/// transaction; a failed commit leaves prior state untouched.
pub fn run_script(script: &str) -> Result<String> {
    tracing::debug!("Executing nft script:\n{}", script);

    let output = Command::new("nft")
        .arg("-f")
        .arg("-")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .and_then(|mut child| {
            use std::io::Write;
            if let Some(stdin) = child.stdin.as_mut() {
                stdin.write_all(script.as_bytes())?;
            }
            child.wait_with_output()
        })
        .map_err(|e| Error::PacketFilter(format!("Failed to execute nft script: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::PacketFilter(format!("nft script failed: {}", stderr)));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Names of inet tables present in the current netns.
pub fn list_inet_tables() -> Result<Vec<String>> {
    let out = run_command(&["list", "tables", "inet"])?;
    Ok(parse_table_list(&out))
}

pub(crate) fn parse_table_list(out: &str) -> Vec<String> {
    out.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next(), parts.next()) {
                (Some("table"), Some("inet"), Some(name)) => Some(name.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// One transaction replacing `table` with the given body. The `add` makes the
/// subsequent `delete` valid when the table does not exist yet.
pub fn replace_script(table: &str, payload: &str) -> String {
    format!("add table inet {}\ndelete table inet {}\n{}", table, table, payload)
}

/// One transaction deleting the given tables.
pub fn delete_script(tables: &[String]) -> String {
    tables
        .iter()
        .map(|table| format!("delete table inet {}\n", table))
        .collect()
}

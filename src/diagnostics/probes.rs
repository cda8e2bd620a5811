//! Probe definitions and output parsers.
//!
//! Each probe is one shell command run on the remote host. The parser gets
//! the command's full stdout and turns it into a typed [`ProbeValue`].

use serde::Serialize;

/// A typed probe result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProbeValue {
    /// Percentage, one decimal.
    Percent(f64),
    /// Used/total pair with usage percentage.
    Usage {
        used: String,
        total: String,
        percent: f64,
    },
    /// Free-form text.
    Text(String),
}

/// Parses a probe's stdout.
pub type ProbeParser = fn(&str) -> Result<ProbeValue, String>;

/// One diagnostic probe.
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    /// Report field name.
    pub name: &'static str,
    /// Shell command run on the remote host.
    pub command: &'static str,
    pub parse: ProbeParser,
}

const CPU_COMMAND: &str =
    r"top -bn1 | grep 'Cpu(s)' | sed 's/.*, *\([0-9.]*\)%* id.*/\1/' | awk '{print 100 - $1}'";

const MEMORY_COMMAND: &str = r"free -m | grep 'Mem:' | awk '{print $3,$2}'";

const DISK_COMMAND: &str = r"df -h / | awk 'NR==2 {print $3,$2,$5}'";

// Samples /proc/net/dev twice, one second apart, over all non-loopback
// interfaces.
const NETWORK_COMMAND: &str = r#"S() { sed 's/:/ /' /proc/net/dev | awk 'NR>2 && $1 != "lo" {rx+=$2; tx+=$10} END {print rx+0, tx+0}'; }; A=$(S); sleep 1; B=$(S); echo "$A $B" | awk '{printf "%.1f KB/s in, %.1f KB/s out\n", ($3-$1)/1024, ($4-$2)/1024}'"#;

const SYSTEM_COMMAND: &str = "uname -a";

const UPTIME_COMMAND: &str = "uptime -p";

/// The standard probe set: cpu, memory, disk, network, system, uptime.
#[must_use]
pub fn default_probes() -> Vec<Probe> {
    vec![
        Probe {
            name: "cpu",
            command: CPU_COMMAND,
            parse: parse_cpu,
        },
        Probe {
            name: "memory",
            command: MEMORY_COMMAND,
            parse: parse_memory,
        },
        Probe {
            name: "disk",
            command: DISK_COMMAND,
            parse: parse_disk,
        },
        Probe {
            name: "network",
            command: NETWORK_COMMAND,
            parse: parse_text,
        },
        Probe {
            name: "system",
            command: SYSTEM_COMMAND,
            parse: parse_text,
        },
        Probe {
            name: "uptime",
            command: UPTIME_COMMAND,
            parse: parse_text,
        },
    ]
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Parses a single number as a percentage.
pub fn parse_cpu(output: &str) -> Result<ProbeValue, String> {
    let trimmed = output.trim();
    let value: f64 = trimmed
        .parse()
        .map_err(|_| format!("Unexpected cpu output: {:?}", trimmed))?;
    if !value.is_finite() {
        return Err(format!("Unexpected cpu output: {:?}", trimmed));
    }
    Ok(ProbeValue::Percent(round1(value)))
}

/// Parses `<used_mb> <total_mb>`.
pub fn parse_memory(output: &str) -> Result<ProbeValue, String> {
    let parts: Vec<&str> = output.split_whitespace().collect();
    let [used, total, ..] = parts.as_slice() else {
        return Err(format!("Unexpected memory output: {:?}", output.trim()));
    };

    let used: u64 = used
        .parse()
        .map_err(|_| format!("Invalid used memory: {:?}", used))?;
    let total: u64 = total
        .parse()
        .map_err(|_| format!("Invalid total memory: {:?}", total))?;
    if total == 0 {
        return Err("Total memory is zero".to_string());
    }

    Ok(ProbeValue::Usage {
        used: format!("{} MB", used),
        total: format!("{} MB", total),
        percent: round1(used as f64 / total as f64 * 100.0),
    })
}

/// Parses `<used> <size> <pct>%` as printed by `df -h`.
pub fn parse_disk(output: &str) -> Result<ProbeValue, String> {
    let parts: Vec<&str> = output.split_whitespace().collect();
    let [used, total, percent, ..] = parts.as_slice() else {
        return Err(format!("Unexpected disk output: {:?}", output.trim()));
    };

    let percent: f64 = percent
        .trim_end_matches('%')
        .parse()
        .map_err(|_| format!("Invalid disk usage: {:?}", percent))?;

    Ok(ProbeValue::Usage {
        used: (*used).to_string(),
        total: (*total).to_string(),
        percent,
    })
}

/// Takes trimmed output as text. Empty output is an error.
pub fn parse_text(output: &str) -> Result<ProbeValue, String> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err("No output".to_string());
    }
    Ok(ProbeValue::Text(trimmed.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_probe_names() {
        let names: Vec<_> = default_probes().iter().map(|p| p.name).collect();
        assert_eq!(names, ["cpu", "memory", "disk", "network", "system", "uptime"]);
    }

    #[test]
    fn test_parse_cpu() {
        assert_eq!(parse_cpu("12.34\n"), Ok(ProbeValue::Percent(12.3)));
        assert_eq!(parse_cpu("0"), Ok(ProbeValue::Percent(0.0)));
        assert!(parse_cpu("").is_err());
        assert!(parse_cpu("abc").is_err());
        assert!(parse_cpu("NaN").is_err());
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(
            parse_memory("1024 4096\n"),
            Ok(ProbeValue::Usage {
                used: "1024 MB".to_string(),
                total: "4096 MB".to_string(),
                percent: 25.0,
            })
        );
        assert_eq!(
            parse_memory("1000 3000"),
            Ok(ProbeValue::Usage {
                used: "1000 MB".to_string(),
                total: "3000 MB".to_string(),
                percent: 33.3,
            })
        );
        assert!(parse_memory("1024").is_err());
        assert!(parse_memory("1 0").is_err());
        assert!(parse_memory("x y").is_err());
    }

    #[test]
    fn test_parse_disk() {
        assert_eq!(
            parse_disk("12G 50G 24%\n"),
            Ok(ProbeValue::Usage {
                used: "12G".to_string(),
                total: "50G".to_string(),
                percent: 24.0,
            })
        );
        assert!(parse_disk("12G 50G").is_err());
        assert!(parse_disk("12G 50G n/a").is_err());
    }

    #[test]
    fn test_parse_text() {
        assert_eq!(
            parse_text("  up 3 days, 2 hours\n"),
            Ok(ProbeValue::Text("up 3 days, 2 hours".to_string()))
        );
        assert!(parse_text(" \n").is_err());
    }

    #[test]
    fn test_value_serialization() {
        let json = serde_json::to_string(&ProbeValue::Percent(12.5)).unwrap();
        assert_eq!(json, "12.5");

        let json = serde_json::to_string(&ProbeValue::Usage {
            used: "1 MB".to_string(),
            total: "2 MB".to_string(),
            percent: 50.0,
        })
        .unwrap();
        assert_eq!(json, r#"{"used":"1 MB","total":"2 MB","percent":50.0}"#);
    }
}

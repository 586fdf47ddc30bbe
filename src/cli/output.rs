//! Line-based output for the `status` and `cert` commands.

use chrono::{DateTime, Utc};

use crate::client::batch::{BatchReport, FetchedDomain};
use crate::protocol::{DomainStatus, StatusResponse};

/// Line width for separators.
const LINE_WIDTH: usize = 60;

/// ```text
/// CONNECTED CLIENTS
/// ════════════════════════════════════════════════════════════
/// ```
pub fn print_header(title: &str) {
    println!();
    println!("{}", title);
    println!("{}", "═".repeat(LINE_WIDTH));
}

pub fn print_line(icon: &str, message: &str) {
    println!("  {} {}", icon, message);
}

/// Unix seconds as RFC 3339, or `-` for unset.
pub fn format_unix(ts: i64) -> String {
    if ts <= 0 {
        return "-".to_string();
    }
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

pub fn domain_line(status: &DomainStatus) -> String {
    let mut line = format!(
        "{} (updated {}, cert {}B, key {}B, fullchain {}B)",
        status.domain,
        format_unix(status.last_update),
        status.cert_size,
        status.key_size,
        status.fullchain_size
    );
    if !status.error.is_empty() {
        line.push_str(": ");
        line.push_str(&status.error);
    }
    line
}

pub fn print_status(status: &StatusResponse) {
    print_header("CONNECTED CLIENTS");
    if status.clients.is_empty() {
        print_line("-", "none");
    }
    for client in &status.clients {
        print_line(
            "•",
            &format!(
                "{} from {} since {} [{}]",
                client.id,
                client.remote_ip,
                format_unix(client.connected_at),
                client.domains.join(", ")
            ),
        );
    }

    print_header("CERTIFICATES");
    if status.domains.is_empty() {
        print_line("-", "none");
    }
    for domain in &status.domains {
        let icon = if domain.valid { "✓" } else { "✗" };
        print_line(icon, &domain_line(domain));
    }
    println!();
    println!("generated at {}", format_unix(status.generated_at));
}

pub fn fetched_line(fetched: &FetchedDomain) -> String {
    let mut line = format!(
        "{} ({} files, updated {})",
        fetched.domain,
        fetched.files,
        format_unix(fetched.timestamp)
    );
    if let Some(dir) = &fetched.saved_to {
        line.push_str(&format!(", saved to {}", dir.display()));
    }
    line
}

pub fn print_batch(report: &BatchReport, dry_run: bool) {
    print_header(if dry_run { "CERTIFICATES (DRY RUN)" } else { "CERTIFICATES" });
    for outcome in &report.domains {
        match &outcome.result {
            Ok(fetched) => {
                print_line("✓", &fetched_line(fetched));
                let verb = if dry_run { "would deploy" } else { "deployed" };
                for target in &fetched.targets {
                    print_line("  •", &format!("{} {}", verb, target.display()));
                }
            }
            Err(e) => print_line("✗", &format!("{}: {}", outcome.domain, e)),
        }
    }

    if report.reloads.is_empty() {
        return;
    }
    print_header("RELOADS");
    for reload in &report.reloads {
        match &reload.result {
            None => print_line("•", &format!("would run {}", reload.command)),
            Some(Ok(_)) => print_line("✓", &reload.command),
            Some(Err(e)) => print_line("✗", &format!("{}: {}", reload.command, e)),
        }
    }
}

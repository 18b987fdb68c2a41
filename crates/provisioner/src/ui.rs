//! Console output helpers.

use colored::Colorize;

use crate::database::ReadinessReport;
use crate::engine::Convergence;

/// Print the tool banner.
pub fn print_banner() {
    println!();
    println!("{}", "eksprov".cyan().bold());
    println!("  {}", "EKS environment provisioning".bright_black());
    println!();
}

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a progress step with step number.
pub fn print_progress_step(current: u8, total: u8, message: &str) {
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "▶".cyan(),
        message.bold()
    );
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a detail line under the current step.
pub fn print_progress(message: &str) {
    println!("  {} {}", "→".cyan(), message);
}

/// Print a check result.
pub fn print_check_result(name: &str, passed: bool, message: Option<&str>) {
    let status = if passed { "✓".green() } else { "✗".red() };
    let text = match message {
        Some(msg) => format!("{name} - {msg}"),
        None => name.to_string(),
    };
    println!("  {status} {text}");
}

/// Print what converging a stage did.
pub fn print_convergence(stage: &str, outcome: Convergence) {
    match outcome {
        Convergence::Unchanged => print_progress(&format!("{stage}: converged, no changes")),
        Convergence::Applied(summary) => print_progress(&format!("{stage}: applied ({summary})")),
    }
}

/// Print a database readiness report, one line per replica.
pub fn print_readiness(report: &ReadinessReport) {
    let line = report.to_string();
    if report.is_ready() {
        print_success(&line);
    } else {
        print_warning(&line);
    }
    for replica in &report.replicas {
        let detail = format!(
            "{} ({}), volumes {}",
            replica.phase,
            if replica.ready { "ready" } else { "not ready" },
            if replica.volumes_bound { "bound" } else { "unbound" }
        );
        print_check_result(&replica.pod, replica.ready && replica.volumes_bound, Some(&detail));
    }
}

/// Print a labelled value.
pub fn print_kv(key: &str, value: &str) {
    println!("  {:<22} {}", format!("{key}:").bright_black(), value);
}

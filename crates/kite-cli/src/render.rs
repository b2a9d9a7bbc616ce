//! Output rendering for the kite CLI.
//!
//! Formats ride reports and dry-run plans for terminal display
//! (Section 7's user-visible behaviour).

use kite_core::{PlanView, RideReport, RideStatus, SegmentStatus};

/// Print the per-segment status table and overall ride outcome.
pub fn print_ride_report(report: &RideReport) {
    println!("Ride: {}", report.ride_name);
    println!();
    println!(
        "  {:<28}  {:<10}  {:<8}  {:<10}  {}",
        "SEGMENT", "STATUS", "ATTEMPTS", "DURATION", "DETAIL"
    );
    println!("  {}", "-".repeat(80));

    for result in report.results.values() {
        let duration = result
            .duration_ms()
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<28}  {:<10}  {:<8}  {:<10}  {}",
            truncate(&result.segment_name, 28),
            format_status(&result.status),
            result.attempts,
            duration,
            detail(&result.status),
        );
    }

    println!();
    println!("Outcome: {}", format_ride_status(report.status));
}

/// Print a dry-run plan: topological order and parallel execution levels.
pub fn print_plan(ride_name: &str, plan: &PlanView<'_>) {
    println!("Plan for ride: {ride_name}");
    println!();
    println!("  Topological order: {}", plan.topological_order.join(" -> "));
    println!();
    println!("  Execution levels:");
    for (index, level) in plan.levels.iter().enumerate() {
        println!("    {index}: {}", level.join(", "));
    }
}

pub fn print_segment_list(names: &[String]) {
    if names.is_empty() {
        println!("No segments defined.");
        return;
    }
    for name in names {
        println!("{name}");
    }
}

pub fn print_ride_list(names: &[String]) {
    if names.is_empty() {
        println!("No rides defined.");
        return;
    }
    for name in names {
        println!("{name}");
    }
}

fn format_status(status: &SegmentStatus) -> &'static str {
    match status {
        SegmentStatus::Pending => "PENDING",
        SegmentStatus::Running => "RUNNING",
        SegmentStatus::Success => "SUCCESS",
        SegmentStatus::Failure { .. } => "FAILURE",
        SegmentStatus::Skipped { .. } => "SKIPPED",
        SegmentStatus::Timeout => "TIMEOUT",
    }
}

fn format_ride_status(status: RideStatus) -> &'static str {
    match status {
        RideStatus::Success => "SUCCESS",
        RideStatus::Failure => "FAILURE",
    }
}

fn detail(status: &SegmentStatus) -> String {
    match status {
        SegmentStatus::Failure { error } => error.to_string(),
        SegmentStatus::Skipped { reason } => reason.as_str().to_string(),
        _ => String::new(),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}

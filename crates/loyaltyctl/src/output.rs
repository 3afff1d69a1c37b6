//! Output formatting - JSON for scripts, short ASCII summaries for people.

use loyalty_common::daily_tasks::DailyTask;
use loyalty_common::referral::CodeValidation;
use loyalty_common::status::StatusSnapshot;
use owo_colors::OwoColorize;

use crate::commands::Reply;

/// Print a reply in the requested format
pub fn print(reply: &Reply, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reply)?);
    } else {
        for line in render(reply) {
            println!("{}", line);
        }
    }
    Ok(())
}

/// Display an error
pub fn print_error(message: &str, json: bool) {
    if json {
        let body = serde_json::json!({ "ok": false, "error": message });
        eprintln!("{}", body);
    } else {
        eprintln!("[ERROR] {}", message.red());
    }
}

/// Human-readable lines for a reply
pub fn render(reply: &Reply) -> Vec<String> {
    match reply {
        Reply::Status(status) => render_status(status),
        Reply::Change(change) => vec![format!(
            "{} {:+} ({}: {}) -> balance {}",
            change.account_id,
            change.delta,
            change.source,
            change.reason,
            change.balance.bold()
        )],
        Reply::History(entries) if entries.is_empty() => vec!["No ledger entries".dimmed().to_string()],
        Reply::History(entries) => entries
            .iter()
            .map(|e| {
                let delta = format!("{:+}", e.delta);
                let delta = if e.delta >= 0 {
                    delta.green().to_string()
                } else {
                    delta.red().to_string()
                };
                format!(
                    "#{:<6} {}  {:>8}  {:<12} {}",
                    e.id,
                    e.created_at.format("%Y-%m-%d %H:%M"),
                    delta,
                    e.source.as_str(),
                    e.reason
                )
            })
            .collect(),
        Reply::Reconcile(report) if report.corrected => vec![format!(
            "[FIXED] {} cached {} corrected to {}",
            report.account_id,
            report.cached,
            report.computed.yellow()
        )],
        Reply::Reconcile(report) => vec![format!(
            "[OK] {} balance {} matches the ledger",
            report.account_id,
            report.computed.green()
        )],
        Reply::Code(code) => vec![format!("Referral code for {}: {}", code.owner_id, code.code.bold())],
        Reply::Validation(validation) => vec![match validation {
            CodeValidation::Valid { owner_id } => format!("[VALID] issued by {}", owner_id).green().to_string(),
            CodeValidation::NotFound => "[NOT FOUND]".red().to_string(),
            CodeValidation::AlreadyUsed => "[USED]".yellow().to_string(),
        }],
        Reply::Activation(a) => vec![
            format!("{} activated {} from {}", a.referee_id, a.code.bold(), a.owner_id),
            format!("  {} +{} -> {}", a.owner_id, a.owner_credit.delta, a.owner_credit.balance),
            format!("  {} +{} -> {}", a.referee_id, a.referee_credit.delta, a.referee_credit.balance),
        ],
        Reply::ReferralStats(stats) => {
            let mut lines = vec![
                format!("Codes issued: {}", stats.codes_issued),
                format!("Activations:  {}", stats.activations),
                format!("Bonus earned: {}", stats.total_bonus),
            ];
            if let Some(code) = &stats.open_code {
                lines.push(format!("Open code:    {}", code.bold()));
            }
            if !stats.referred_accounts.is_empty() {
                lines.push(format!("Referred:     {}", stats.referred_accounts.join(", ")));
            }
            lines
        }
        Reply::Check(outcome) if outcome.unlocked.is_empty() => vec![format!(
            "Evaluated {} achievements, nothing new",
            outcome.evaluated
        )],
        Reply::Check(outcome) => outcome
            .unlocked
            .iter()
            .map(|u| {
                format!(
                    "[UNLOCKED] {} +{} -> balance {}",
                    u.achievement.bright_green(),
                    u.reward,
                    u.balance
                )
            })
            .collect(),
        Reply::Progress(rows) if rows.is_empty() => vec!["No achievement progress yet".dimmed().to_string()],
        Reply::Progress(rows) => rows
            .iter()
            .map(|p| {
                let mark = if p.completed { "[x]".green().to_string() } else { "[ ]".to_string() };
                format!("{} {:<18} {}", mark, p.achievement, p.progress)
            })
            .collect(),
        Reply::Catalog(defs) => defs
            .iter()
            .map(|d| {
                let line = format!(
                    "{:<18} {:<9} {:>5} pts  {}",
                    d.code,
                    d.category.as_str(),
                    d.reward,
                    d.description
                );
                if d.active {
                    line
                } else {
                    line.dimmed().to_string()
                }
            })
            .collect(),
        Reply::Tasks(tasks) => tasks.iter().map(render_task).collect(),
        Reply::TaskUpdate(update) => {
            let mut lines = vec![render_task(&update.task)];
            if let Some(streak) = &update.streak {
                lines.push(format!("Streak: {} days (best {})", streak.current, streak.longest));
                if let Some(m) = &streak.milestone {
                    lines.push(format!("[MILESTONE] {} days +{}", m.length, m.bonus).bright_green().to_string());
                }
            }
            lines
        }
        Reply::Streak(streak) => vec![
            format!("Current streak: {}", streak.current_streak.bold()),
            format!("Longest streak: {}", streak.longest_streak),
            format!("Active days:    {}", streak.total_active_days),
            format!(
                "Last active:    {}",
                streak
                    .last_active_date
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "never".to_string())
            ),
        ],
        Reply::Linked { account_id, network, linked: true } => {
            vec![format!("{} linked {}", account_id, network)]
        }
        Reply::Linked { account_id, network, linked: false } => {
            vec![format!("{} already linked {}", account_id, network).dimmed().to_string()]
        }
        Reply::Purchase(c) if !c.recorded => vec![format!(
            "Purchase {} was already confirmed",
            c.purchase.purchase_id
        )
        .dimmed()
        .to_string()],
        Reply::Purchase(c) => {
            let mut line = format!(
                "Purchase {} confirmed: {} cashback",
                c.purchase.purchase_id, c.purchase.cashback
            );
            if let Some(job) = &c.pending {
                line.push_str(&format!(", due {}", job.due_at.format("%Y-%m-%d %H:%M:%S")));
            }
            vec![line]
        }
        Reply::Scheduled(job) => vec![format!(
            "Pending credit #{}: {} +{} due {}",
            job.id,
            job.account_id,
            job.amount,
            job.due_at.format("%Y-%m-%d %H:%M:%S")
        )],
        Reply::Swept(applied) => {
            let total: i64 = applied.iter().map(|c| c.change.delta).sum();
            vec![format!("Applied {} pending credits ({} points)", applied.len(), total)]
        }
    }
}

fn render_status(status: &StatusSnapshot) -> Vec<String> {
    let mut lines = vec![
        format!("Account:  {}", status.account_id),
        format!("Balance:  {}", status.balance.bold()),
        format!("Tier:     {} ({}% cashback)", status.tier.cyan(), status.cashback_percent),
    ];
    if let (Some(next), Some(needed)) = (&status.next_tier, status.points_to_next) {
        lines.push(format!("Next:     {} in {} points", next, needed));
    }
    lines
}

fn render_task(task: &DailyTask) -> String {
    let mark = if task.completed { "[x]".green().to_string() } else { "[ ]".to_string() };
    format!(
        "{} {:<18} {}/{}  +{}",
        mark, task.name, task.progress, task.target, task.reward
    )
}

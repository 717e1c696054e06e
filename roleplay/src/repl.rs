//! Line-oriented session loop.
//!
//! - Lines starting with `#` are commands (quit, status, help)
//! - Any other line is sent to the persona
//! - Persona lines are printed as `[PERSONA]` blocks, engine notices as `[NOTICE]`

use chrono::{DateTime, Utc};
use roleplay_core::{ChatResponse, ConversationLog, DialogueEngine, EngineError, LogRole, Session};
use std::io::{self, BufRead, Write};

/// Who is playing and on which session.
pub struct Learner {
    pub activity: String,
    pub user: String,
    pub session: String,
    pub name: String,
}

const HELP: &[&str] = &[
    "  #quit    - Exit (progress is saved after every message)",
    "  #status  - Show progress per unit",
    "  #help    - Show this help",
    "  (anything else is said to the persona)",
];

pub async fn run(engine: &DialogueEngine, learner: &Learner) -> anyhow::Result<()> {
    let session = engine
        .initialize(&learner.activity, &learner.session, &learner.user, &learner.name)
        .await?;

    println!("=== Roleplay: {} ===", learner.activity);
    println!("Session: {} (user {})", learner.session, learner.user);
    println!();
    println!("Commands:");
    for line in HELP {
        println!("{line}");
    }
    println!();

    if session.is_completed() {
        println!("[DONE]\n{}", session.summary);
        return Ok(());
    }
    print_recent(&session, None);

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("Error reading input: {e}");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('#') {
            match command.split_whitespace().next() {
                Some("quit") | Some("exit") => {
                    println!("Goodbye!");
                    break;
                }
                Some("status") => print_status(engine, learner).await,
                Some("help") => {
                    println!("[HELP]");
                    for line in HELP {
                        println!("{line}");
                    }
                }
                _ => println!("[ERROR] Unknown command. Type #help for help."),
            }
            stdout.flush().ok();
            continue;
        }

        print!("[THINKING]");
        stdout.flush().ok();

        let sent_at = Utc::now();
        let result = engine
            .chat(&learner.activity, &learner.session, &learner.user, line)
            .await;

        print!("\r            \r");
        stdout.flush().ok();

        match result {
            Ok(response) => {
                print_response(&response, sent_at);
                if response.course_completed {
                    println!("[DONE]\n{}", response.session.summary);
                    break;
                }
            }
            Err(EngineError::CourseCompleted(_)) => {
                println!("[DONE] This course is already complete.");
                break;
            }
            Err(e) => println!("[ERROR] {}", e.user_message()),
        }
    }

    Ok(())
}

fn print_line(log: &ConversationLog) {
    let speaker = match log.role {
        LogRole::Assistant => "PERSONA",
        LogRole::User => "YOU",
    };
    println!("[{speaker}]");
    for para in log.content.split("\n\n") {
        println!("{para}");
    }
    println!();
}

/// Print every persona line written since `since`, or the whole current
/// unit when `since` is `None`.
fn print_recent(session: &Session, since: Option<DateTime<Utc>>) {
    let mut lines: Vec<&ConversationLog> = match since {
        Some(since) => session
            .unit_results
            .iter()
            .flat_map(|u| u.conversation_logs.iter())
            .filter(|l| l.role == LogRole::Assistant && l.timestamp >= since)
            .collect(),
        None => session
            .unit_results
            .iter()
            .rev()
            .find(|u| u.has_logs())
            .map(|u| u.conversation_logs.iter().collect())
            .unwrap_or_default(),
    };
    lines.sort_by_key(|l| l.timestamp);
    for line in lines {
        print_line(line);
    }
}

fn print_response(response: &ChatResponse, sent_at: DateTime<Utc>) {
    if response.limit_reached {
        println!("[NOTICE] {}\n", response.assistant_reply);
    }
    print_recent(&response.session, Some(sent_at));
}

async fn print_status(engine: &DialogueEngine, learner: &Learner) {
    match engine
        .session(&learner.activity, &learner.session, &learner.user)
        .await
    {
        Ok(Some(session)) => {
            println!("[STATUS]");
            for unit in &session.unit_results {
                println!(
                    "  {}: {} ({} turns)",
                    unit.unit_id,
                    unit.status.name(),
                    unit.turn_count
                );
            }
            if session.is_completed() {
                println!("  Course complete");
            }
        }
        Ok(None) => println!("[ERROR] Session not found."),
        Err(e) => println!("[ERROR] {}", e.user_message()),
    }
}

use std::io::{self, Write};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use super::{parse_command, Frame, Renderer};
use crate::bus::{Event, EventBus};

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// Plain-text dashboard written to any `Write`.
pub struct ConsoleRenderer<W: Write + Send> {
    out: W,
    log_lines: usize,
    clear: bool,
}

impl ConsoleRenderer<io::Stdout> {
    pub fn stdout(log_lines: usize) -> Self {
        Self {
            out: io::stdout(),
            log_lines,
            clear: true,
        }
    }
}

impl<W: Write + Send> ConsoleRenderer<W> {
    /// Renderer without screen clearing, for capturing output.
    pub fn plain(out: W, log_lines: usize) -> Self {
        Self {
            out,
            log_lines,
            clear: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Renderer for ConsoleRenderer<W> {
    fn render(&mut self, frame: &Frame) -> io::Result<()> {
        let state = &frame.state;
        let mut text = String::new();
        if self.clear {
            text.push_str(CLEAR_SCREEN);
        }

        let time = state
            .system_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "--".to_string());
        let status = if state.paused { "PAUSED" } else { "LIVE" };
        text.push_str(&format!("HYDRA  {time}  [{status}]  rev {}\n", state.revision));

        text.push_str("\nBots\n");
        for bot in &state.bots {
            let marker = if state.selected_bot.as_deref() == Some(bot.name.as_str()) {
                '>'
            } else {
                ' '
            };
            let link = if bot.connected { "up" } else { "down" };
            text.push_str(&format!(
                "{marker} {:<10} {:<4} {:<24} {}\n",
                bot.name,
                link,
                bot.subscriptions.join(","),
                bot.last_report.as_deref().unwrap_or("")
            ));
        }

        text.push_str("\nPositions\n");
        text.push_str(&format!(
            "  {:<8} {:>6} {:>12} {:>12} {:>10} {:>10} {:>12}\n",
            "symbol", "qty", "avg cost", "mkt price", "unreal", "real", "last"
        ));
        for row in &state.positions {
            let last = state
                .last_prices
                .get(&row.symbol)
                .map(|p| format!("{p:.2}"))
                .unwrap_or_else(|| "--".to_string());
            text.push_str(&format!(
                "  {:<8} {:>6} {:>12.2} {:>12.2} {:>10.0} {:>10.0} {:>12}\n",
                row.symbol,
                row.quantity,
                row.average_cost,
                row.market_price,
                row.unrealized_pnl,
                row.realized_pnl,
                last
            ));
        }

        if !state.account_summary.is_empty() {
            text.push_str("\nAccount\n");
            for (tag, value) in &state.account_summary {
                text.push_str(&format!("  {tag:<20} {value}\n"));
            }
        }

        for (symbol, bars) in &state.bars {
            let closes: Vec<String> = bars.iter().map(|bar| format!("{:.2}", bar.close)).collect();
            text.push_str(&format!("\n{symbol} closes  {}\n", closes.join(" ")));
        }

        text.push_str("\nLog\n");
        let skip = frame.log_tail.len().saturating_sub(self.log_lines);
        for line in frame.log_tail.iter().skip(skip) {
            text.push_str(&format!("  {line}\n"));
        }
        text.push_str("\n[q]uit  [p]ause  [r]estart  bot NAME  or type for the selected bot\n");

        self.out.write_all(text.as_bytes())?;
        self.out.flush()
    }
}

/// Read stdin line by line and publish each parsed command on the bus.
/// The task ends at end of input.
pub fn spawn_input_reader(bus: Arc<EventBus>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(command) = parse_command(&line) {
                        bus.publish(Event::UserCommand(command));
                    }
                }
                Ok(None) => {
                    tracing::debug!("stdin closed");
                    break;
                }
                Err(err) => {
                    tracing::warn!("failed to read stdin: {err}");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{BotStatus, WorldState};

    #[test]
    fn frame_shows_positions_bots_and_log() {
        let mut state = WorldState::with_universe(vec!["MES".into(), "MNQ".into()]);
        state.paused = true;
        state.last_prices.insert("MES".into(), 5001.25);
        state.bots.push(BotStatus {
            name: "master".into(),
            connected: true,
            subscriptions: vec!["ticks:MES".into()],
            last_report: Some("streaming MES".into()),
        });
        state.selected_bot = Some("master".into());

        let mut renderer = ConsoleRenderer::plain(Vec::new(), 2);
        renderer
            .render(&Frame {
                state: Arc::new(state),
                log_tail: vec!["one".into(), "two".into(), "three".into()],
            })
            .unwrap();
        let out = String::from_utf8(renderer.into_inner()).unwrap();

        assert!(out.contains("[PAUSED]"));
        assert!(out.contains("> master"));
        assert!(out.contains("5001.25"));
        assert!(out.contains("MNQ"));
        assert!(!out.contains("  one\n"));
        assert!(out.contains("  three\n"));
        assert!(!out.starts_with(CLEAR_SCREEN));
    }
}

// src/display/terminal.rs
//! Terminal rendering of live tracking status and trip playback

use crate::{
    error::Result,
    playback::{format_clock, Frame},
    position::Position,
    tracker::TrackerStatus,
};
use crossterm::{
    cursor::{Hide, MoveTo, Show},
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
    terminal::{Clear, ClearType, DisableLineWrap, EnableLineWrap},
};
use std::{
    io::{self, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};
use tokio::time::sleep;

const RULE_WIDTH: usize = 60;
const BAR_WIDTH: usize = 40;

pub struct TerminalDisplay {
    refresh: Duration,
}

impl TerminalDisplay {
    pub fn new() -> Self {
        Self {
            refresh: Duration::from_secs(1),
        }
    }

    /// Redraw the tracker status until `running` is cleared
    pub async fn run(
        &self,
        status: Arc<RwLock<TrackerStatus>>,
        running: Arc<AtomicBool>,
    ) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(stdout, Hide, DisableLineWrap)?;

        while running.load(Ordering::Relaxed) {
            execute!(stdout, Clear(ClearType::All), MoveTo(0, 0))?;

            let snapshot = status.read().unwrap_or_else(PoisonError::into_inner).clone();
            self.render_status(&mut stdout, &snapshot)?;

            stdout.flush()?;
            sleep(self.refresh).await;
        }

        execute!(stdout, Show, EnableLineWrap)?;
        Ok(())
    }

    pub fn render_status(&self, stdout: &mut impl Write, status: &TrackerStatus) -> Result<()> {
        self.render_header(stdout, "Fleet Tracker - Live Session")?;

        let updated = match status.updated_at {
            Some(ts) => ts.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            None => "No data received".to_string(),
        };
        execute!(stdout, Print(format!("Last Update: {}\n\n", updated)))?;

        self.render_session_section(stdout, status)?;
        self.render_position_section(stdout, status.last_position.as_ref())?;
        self.render_sync_section(stdout, status)?;
        if status.violations > 0 {
            self.render_geofence_section(stdout, status)?;
        }

        if let Some(kind) = status.last_error {
            execute!(
                stdout,
                SetForegroundColor(Color::Red),
                Print(format!("{}\n\n", kind.user_message())),
                ResetColor
            )?;
        }

        self.render_footer(stdout, "Press Ctrl+C to stop tracking")
    }

    fn render_header(&self, stdout: &mut impl Write, title: &str) -> Result<()> {
        execute!(
            stdout,
            SetForegroundColor(Color::Green),
            Print("=".repeat(RULE_WIDTH)),
            Print("\n"),
            Print(title),
            Print("\n"),
            Print("=".repeat(RULE_WIDTH)),
            Print("\n"),
            ResetColor
        )?;
        Ok(())
    }

    fn render_footer(&self, stdout: &mut impl Write, hint: &str) -> Result<()> {
        execute!(
            stdout,
            SetForegroundColor(Color::Green),
            Print("=".repeat(RULE_WIDTH)),
            Print("\n"),
            Print(hint),
            Print("\n"),
            ResetColor
        )?;
        Ok(())
    }

    fn render_session_section(
        &self,
        stdout: &mut impl Write,
        status: &TrackerStatus,
    ) -> Result<()> {
        execute!(stdout, SetForegroundColor(Color::Yellow), Print("SESSION:\n"), ResetColor)?;

        let state = if status.active { "tracking" } else { "stopped" };
        execute!(
            stdout,
            Print(format!("  Route:     {}\n", status.route_name.as_deref().unwrap_or("-"))),
            Print(format!("  Session:   {}\n", status.session_id.as_deref().unwrap_or("-"))),
            Print(format!("  State:     {}\n", state)),
            Print(format!("  Distance:  {:>9.2} km\n", status.distance_km())),
            Print(format!("  Samples:   {:>9}\n\n", status.samples))
        )?;
        Ok(())
    }

    fn render_position_section(
        &self,
        stdout: &mut impl Write,
        position: Option<&Position>,
    ) -> Result<()> {
        execute!(stdout, SetForegroundColor(Color::Cyan), Print("POSITION:\n"), ResetColor)?;

        let Some(p) = position else {
            execute!(stdout, Print("  Waiting for fix\n\n"))?;
            return Ok(());
        };
        let speed = p.speed_mps.map(|_| format!("{:.1}", p.speed_kmh()));
        execute!(
            stdout,
            Print(format!("  Latitude:  {}\n", Position::format_coordinate(p.latitude))),
            Print(format!("  Longitude: {}\n", Position::format_coordinate(p.longitude))),
            Print(format!("  Accuracy:  {:>12.1} m\n", p.accuracy_meters)),
            Print(format!("  Speed:     {}\n\n", Position::format_value(speed, "km/h")))
        )?;
        Ok(())
    }

    fn render_sync_section(&self, stdout: &mut impl Write, status: &TrackerStatus) -> Result<()> {
        execute!(stdout, SetForegroundColor(Color::Magenta), Print("SYNC:\n"), ResetColor)?;

        if status.online {
            execute!(stdout, Print("  Store:     online\n"))?;
        } else {
            execute!(
                stdout,
                SetForegroundColor(Color::Red),
                Print("  Store:     offline, saving locally\n"),
                ResetColor
            )?;
        }
        execute!(stdout, Print(format!("  Queued:    {:>9}\n\n", status.queued)))?;
        Ok(())
    }

    fn render_geofence_section(
        &self,
        stdout: &mut impl Write,
        status: &TrackerStatus,
    ) -> Result<()> {
        execute!(stdout, SetForegroundColor(Color::Red), Print("GEOFENCE:\n"), ResetColor)?;
        execute!(stdout, Print(format!("  Violations: {}\n", status.violations)))?;
        if let Some(v) = &status.last_violation {
            execute!(
                stdout,
                Print(format!(
                    "  Last:       {:.0} m from center at {}\n",
                    v.distance_meters,
                    v.at.format("%H:%M:%S")
                ))
            )?;
        }
        execute!(stdout, Print("\n"))?;
        Ok(())
    }

    /// One playback line: progress bar, clock and running statistics
    pub fn render_frame(
        &self,
        stdout: &mut impl Write,
        frame: &Frame,
        len: usize,
        duration: chrono::Duration,
    ) -> Result<()> {
        let progress = if len > 1 {
            frame.index as f64 / (len - 1) as f64
        } else {
            1.0
        };
        let filled = (progress * BAR_WIDTH as f64).round() as usize;
        let empty = BAR_WIDTH - filled.min(BAR_WIDTH);
        let bar = format!("{}{}", "#".repeat(filled), "-".repeat(empty));
        let total_seconds = duration.num_milliseconds() as f64 / 1000.0;

        execute!(
            stdout,
            Print("\r"),
            SetForegroundColor(Color::Cyan),
            Print(format!("[{}]", bar)),
            ResetColor,
            Print(format!(
                " {} / {}  {:>8.2} km  {:>6.1} km/h  ({}/{})",
                format_clock(frame.stats.elapsed_seconds),
                format_clock(total_seconds),
                frame.stats.total_distance_meters / 1000.0,
                frame.stats.average_speed_kmh,
                frame.index + 1,
                len
            ))
        )?;
        stdout.flush()?;
        Ok(())
    }
}

impl Default for TerminalDisplay {
    fn default() -> Self {
        Self::new()
    }
}

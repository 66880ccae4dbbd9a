//! Host-side subscribers
//!
//! [`PrintWatch`] writes projections to stdout and [`ConfigWatch`] turns the
//! focus and main-instrument keys into a [`ConfigChange`] for its listeners.

use std::sync::{Arc, Mutex};

use colored::Colorize;
use eyre::Result;
use tracing::{debug, error};

use crate::dispatch::DispatchHandle;
use crate::value::{ChannelEvent, StatusMap, StatusValue};

/// Prints every projection it receives, one line per callback
#[derive(Debug, Clone)]
pub struct PrintWatch {
    pub id: String,
    pub keys: Vec<String>,
}

impl PrintWatch {
    pub fn new(id: impl Into<String>, keys: Vec<String>) -> Self {
        Self { id: id.into(), keys }
    }

    /// Register this watch with the dispatcher
    pub fn register(&self, handle: &DispatchHandle) -> Result<()> {
        let id = self.id.clone();
        handle.register_status(&self.id, self.keys.clone(), move |map: &StatusMap| {
            println!("{}", format_line(&id, map));
            Ok(())
        })
    }

    /// Print every event arriving on `channels`
    pub fn register_channels(handle: &DispatchHandle, id: &str, channels: &[String]) -> Result<()> {
        handle.register_channel(id, channels.iter().cloned(), |event: &ChannelEvent| {
            println!("{}", format_event(event));
            Ok(())
        })
    }
}

fn format_value(value: &StatusValue) -> String {
    match value {
        StatusValue::NoData => value.to_string().yellow().to_string(),
        StatusValue::Error => value.to_string().red().bold().to_string(),
        other => other.to_string(),
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

/// Render one projection as `time id: KEY=value ...`
pub fn format_line(id: &str, map: &StatusMap) -> String {
    let fields: Vec<String> = map.iter().map(|(k, v)| format!("{}={}", k, format_value(v))).collect();
    format!("{} {}: {}", timestamp().dimmed(), id.cyan(), fields.join(" "))
}

pub fn format_event(event: &ChannelEvent) -> String {
    format!(
        "{} [{}] {} {}",
        timestamp().dimmed(),
        event.channel.magenta(),
        event.path,
        event.value
    )
}

/// Focus or instrument change
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigChange {
    pub focus: StatusValue,
    pub instrument: StatusValue,
}

type ChangeListener = Box<dyn Fn(&ConfigChange) -> Result<()> + Send + Sync>;

/// Built-in watch on the telescope focus and main instrument
#[derive(Clone, Default)]
pub struct ConfigWatch {
    listeners: Arc<Mutex<Vec<ChangeListener>>>,
}

impl ConfigWatch {
    pub const ID: &'static str = "chg-config";
    pub const FOCUS_KEY: &'static str = "STATL.TSC_F_SELECT";
    pub const INSTRUMENT_KEY: &'static str = "FITS.SBR.MAINOBCP";

    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener for configuration changes
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(&ConfigChange) -> Result<()> + Send + Sync + 'static,
    {
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.push(Box::new(listener)),
            Err(_) => error!("ConfigWatch::on_change: listener lock poisoned"),
        }
    }

    /// Subscribe to the focus and instrument keys
    pub fn register(&self, handle: &DispatchHandle) -> Result<()> {
        let watch = self.clone();
        handle.register_status(
            Self::ID,
            [Self::FOCUS_KEY, Self::INSTRUMENT_KEY],
            move |map: &StatusMap| {
                watch.notify(map);
                Ok(())
            },
        )
    }

    /// Build a change from a projection and hand it to every listener
    ///
    /// A failing listener is logged and does not stop the others.
    pub fn notify(&self, map: &StatusMap) {
        let change = ConfigChange {
            focus: map.get(Self::FOCUS_KEY).cloned().unwrap_or(StatusValue::NoData),
            instrument: map.get(Self::INSTRUMENT_KEY).cloned().unwrap_or(StatusValue::NoData),
        };
        debug!(focus = %change.focus, instrument = %change.instrument, "ConfigWatch::notify");

        let Ok(listeners) = self.listeners.lock() else {
            error!("ConfigWatch::notify: listener lock poisoned");
            return;
        };
        for listener in listeners.iter() {
            if let Err(e) = listener(&change) {
                error!(error = ?e, "Error making callback for change-config");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_line_lists_every_key() {
        let mut map = StatusMap::new();
        map.insert("A.X".to_string(), StatusValue::Int(1));
        map.insert("A.Y".to_string(), StatusValue::NoData);

        let line = format_line("tel", &map);
        assert!(line.contains("tel"));
        assert!(line.contains("A.X=1"));
        assert!(line.contains("<no data>"));
    }

    #[test]
    fn test_format_event() {
        let event = ChannelEvent::from_path("mon.alarm.TSC", json!("high")).unwrap();
        let line = format_event(&event);
        assert!(line.contains("alarm"));
        assert!(line.contains("mon.alarm.TSC"));
    }

    #[test]
    fn test_config_watch_notifies_all_listeners() {
        let watch = ConfigWatch::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        watch.on_change(|_| Err(eyre::eyre!("listener failed")));
        let s = seen.clone();
        watch.on_change(move |change| {
            s.lock().unwrap().push(change.clone());
            Ok(())
        });

        let mut map = StatusMap::new();
        map.insert(ConfigWatch::FOCUS_KEY.to_string(), StatusValue::from("P_OPT"));
        map.insert(ConfigWatch::INSTRUMENT_KEY.to_string(), StatusValue::from("HSC"));
        watch.notify(&map);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].focus, StatusValue::Text("P_OPT".to_string()));
        assert_eq!(seen[0].instrument, StatusValue::Text("HSC".to_string()));
    }

    #[test]
    fn test_config_watch_missing_keys_are_no_data() {
        let watch = ConfigWatch::new();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        watch.on_change(move |change| {
            *s.lock().unwrap() = Some(change.clone());
            Ok(())
        });

        watch.notify(&StatusMap::new());
        let change = seen.lock().unwrap().clone().unwrap();
        assert!(change.focus.is_no_data());
        assert!(change.instrument.is_no_data());
    }
}

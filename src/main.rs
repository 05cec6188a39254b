use aircast::audio_runtime::spawn_audio_runtime;
use aircast::core::{EngineEvent, PlayoutCore};
use aircast::engine::Engine;
use aircast::player::Player;
use aircast::resolver::StoreResolver;
use aircast::sequence::{MarkerKind, SequenceItem};
use aircast::track::Track;
use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "aircast", about = "Broadcast Playout Engine CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show engine status
    Status,
    /// Sequence management
    Seq {
        #[command(subcommand)]
        action: SeqCmd,
    },
    /// Start playout (blocks until the sequence finishes)
    Play {
        /// Sequence item id to start from
        #[arg(short, long)]
        item: Option<u64>,
    },
    /// Engine configuration
    Config {
        #[command(subcommand)]
        action: ConfigCmd,
    },
    /// List available output devices
    Devices,
}

#[derive(Subcommand)]
enum SeqCmd {
    /// Add track(s) to the sequence
    Add {
        /// Audio file path(s)
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Insert at position instead of appending
        #[arg(long)]
        at: Option<usize>,
    },
    /// Add a time-fix marker (HH:MM or HH:MM:SS, today, local time)
    Mark {
        time: String,
        /// hard = fade and jump at the time; soft = skip overdue items
        #[arg(long, default_value = "soft")]
        kind: String,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        at: Option<usize>,
    },
    /// List the sequence
    List,
    /// Remove an item by id
    Remove { id: u64 },
    /// Move an item from one position to another
    Reorder { from: usize, to: usize },
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Show current policy
    Show,
    /// Crossfade settings
    Crossfade {
        #[arg(long)]
        enabled: bool,
        #[arg(long)]
        secs: Option<f64>,
    },
    /// Artist/title separation in minutes
    Separation {
        #[arg(long)]
        artist: Option<f64>,
        #[arg(long)]
        title: Option<f64>,
    },
    /// Auto-fill settings
    Autofill {
        #[arg(long)]
        folder: Option<PathBuf>,
        #[arg(long)]
        lead_secs: Option<f64>,
        #[arg(long)]
        target_secs: Option<f64>,
    },
    /// Ducking levels
    Ducking {
        #[arg(long)]
        mic: Option<f32>,
        #[arg(long)]
        cart: Option<f32>,
        #[arg(long)]
        fade_secs: Option<f64>,
    },
    /// Output device by name (empty = system default)
    Device { name: Option<String> },
}

fn main() {
    let cli = Cli::parse();
    let mut engine = Engine::load();

    let result = match cli.command {
        Commands::Status => cmd_status(&engine),
        Commands::Seq { action } => cmd_seq(&mut engine, action),
        Commands::Play { item } => cmd_play(engine, item),
        Commands::Config { action } => cmd_config(&mut engine, action),
        Commands::Devices => {
            for name in Player::output_device_names() {
                println!("{}", name);
            }
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn cmd_status(engine: &Engine) -> Result<(), String> {
    println!("Sequence items : {}", engine.sequence.len());
    println!("Playing        : {}", engine.is_playing);
    println!(
        "Current item   : {}",
        engine
            .current_item_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("Crossfade      : {} ({}s)",
        engine.policy.crossfade_enabled, engine.policy.crossfade_secs);
    println!(
        "Auto-fill      : lead {}s, target {}s, folder {}",
        engine.policy.autofill_lead_secs,
        engine.policy.autofill_target_secs,
        engine
            .autofill_folder
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    Ok(())
}

fn cmd_seq(engine: &mut Engine, action: SeqCmd) -> Result<(), String> {
    match action {
        SeqCmd::Add { files, at } => {
            let mut pos = at;
            for file in files {
                let track = Track::from_path(&file)?;
                let id = engine.sequence.insert_track(track, pos)?;
                println!("Added item {} ({})", id, file.display());
                pos = pos.map(|p| p + 1);
            }
            engine.save()?;
            Ok(())
        }
        SeqCmd::Mark {
            time,
            kind,
            label,
            at,
        } => {
            let kind = match kind.to_lowercase().as_str() {
                "hard" => MarkerKind::Hard,
                "soft" => MarkerKind::Soft,
                other => return Err(format!("Unknown marker kind '{}'", other)),
            };
            let when = parse_marker_time(&time)?;
            let id = engine.sequence.insert_marker(when, kind, label, at)?;
            println!("Added {} marker {} at {}", kind, id, when);
            engine.save()?;
            Ok(())
        }
        SeqCmd::List => {
            for (idx, item) in engine.sequence.items().iter().enumerate() {
                match item {
                    SequenceItem::Track(t) => println!(
                        "{:3} #{:<4} {} — {} [{}]",
                        idx,
                        t.id,
                        t.artist,
                        t.title,
                        t.duration_display()
                    ),
                    SequenceItem::Marker(m) => println!(
                        "{:3} #{:<4} {} marker @ {}{}",
                        idx,
                        m.id,
                        m.kind,
                        m.time.with_timezone(&Local).format("%H:%M:%S"),
                        m.label
                            .as_ref()
                            .map(|l| format!(" ({})", l))
                            .unwrap_or_default()
                    ),
                    SequenceItem::Pick { id, source } => {
                        println!("{:3} #{:<4} random pick from {:?}", idx, id, source)
                    }
                }
            }
            Ok(())
        }
        SeqCmd::Remove { id } => {
            engine.sequence.remove(id)?;
            println!("Removed item {}", id);
            engine.save()?;
            Ok(())
        }
        SeqCmd::Reorder { from, to } => {
            engine.sequence.reorder(from, to)?;
            engine.save()?;
            Ok(())
        }
    }
}

fn cmd_config(engine: &mut Engine, action: ConfigCmd) -> Result<(), String> {
    match action {
        ConfigCmd::Show => {
            let json = serde_json::to_string_pretty(&engine.policy)
                .map_err(|e| format!("Serialize error: {}", e))?;
            println!("{}", json);
            return Ok(());
        }
        ConfigCmd::Crossfade { enabled, secs } => {
            engine.policy.crossfade_enabled = enabled;
            if let Some(s) = secs {
                engine.policy.crossfade_secs = s;
            }
        }
        ConfigCmd::Separation { artist, title } => {
            if let Some(a) = artist {
                engine.policy.artist_separation_mins = a;
            }
            if let Some(t) = title {
                engine.policy.title_separation_mins = t;
            }
        }
        ConfigCmd::Autofill {
            folder,
            lead_secs,
            target_secs,
        } => {
            if folder.is_some() {
                engine.autofill_folder = folder;
            }
            if let Some(l) = lead_secs {
                engine.policy.autofill_lead_secs = l;
            }
            if let Some(t) = target_secs {
                engine.policy.autofill_target_secs = t;
            }
        }
        ConfigCmd::Ducking { mic, cart, fade_secs } => {
            if let Some(m) = mic {
                engine.policy.mic_duck_level = m;
            }
            if let Some(c) = cart {
                engine.policy.cart_duck_level = c;
            }
            if let Some(f) = fade_secs {
                engine.policy.duck_fade_secs = f;
            }
        }
        ConfigCmd::Device { name } => {
            engine.output_device = name;
        }
    }
    engine.save()?;
    println!("Configuration updated.");
    Ok(())
}

fn cmd_play(engine: Engine, item: Option<u64>) -> Result<(), String> {
    let device = engine.output_device.clone();
    let store = Engine::default_state_path()
        .parent()
        .map(|p| p.join("store"))
        .unwrap_or_else(|| PathBuf::from("store"));

    let mut core = PlayoutCore::new(engine, Box::new(StoreResolver::new(store)));

    let (tx, rx) = mpsc::channel();
    let handle = spawn_audio_runtime(device, move |evt| {
        let _ = tx.send(evt);
    });
    core.attach_audio(handle.clone());

    match item {
        Some(id) => core.play_item(id, Utc::now())?,
        None => core.toggle_play(Utc::now())?,
    }

    while core.is_playing() {
        while let Ok(evt) = rx.try_recv() {
            core.handle_audio_event(evt, Utc::now());
        }
        core.tick(Utc::now());
        for event in core.drain_events() {
            match event {
                EngineEvent::PlaybackStarted { item_id } => {
                    if let Some(track) = core
                        .engine
                        .sequence
                        .find(item_id)
                        .and_then(|i| i.as_track())
                    {
                        println!(
                            "Now playing: {} — {} [{}]",
                            track.artist,
                            track.title,
                            track.duration_display()
                        );
                    }
                }
                EngineEvent::TrackEnded { item_id } => {
                    println!("Finished item {}", item_id);
                }
                _ => {}
            }
        }
        std::thread::sleep(Duration::from_millis(250));
    }

    handle.shutdown();
    core.engine.save()?;
    println!("Playout finished.");
    Ok(())
}

/// Parse a time of day (HH:MM or HH:MM:SS) into today's wall-clock instant.
fn parse_marker_time(s: &str) -> Result<DateTime<Utc>, String> {
    let time = NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| format!("Invalid time '{}'. Expected HH:MM or HH:MM:SS", s))?;
    let today = Local::now().date_naive();
    let local = Local
        .from_local_datetime(&today.and_time(time))
        .single()
        .ok_or_else(|| format!("Ambiguous local time '{}'", s))?;
    Ok(local.with_timezone(&Utc))
}

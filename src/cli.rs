use log::info;

use crate::{
    database::Database,
    error::DbError,
    journal::recovery,
    page::{Page, PageType},
    tree::icheck,
    types::DbResult,
    utils::HandyRwLock,
};

/// The administrative command set: a tagged variant per command, each
/// carrying its parsed arguments; dispatch is a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open { config_path: String },
    Close,
    List,
    Select { volume: String, tree: Option<String> },
    ViewPage { page: u64 },
    JournalScan { generation: Option<u64> },
    Icheck,
    BackupStart,
    BackupStop,
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> DbResult<Command> {
        let mut words = line.split_whitespace();
        let verb = words
            .next()
            .ok_or_else(|| DbError::validation("empty command"))?;

        let command = match verb {
            "open" => Command::Open {
                config_path: words
                    .next()
                    .ok_or_else(|| DbError::validation("open needs a config path"))?
                    .to_string(),
            },
            "close" => Command::Close,
            "list" => Command::List,
            "select" => Command::Select {
                volume: words
                    .next()
                    .ok_or_else(|| DbError::validation("select needs a volume name"))?
                    .to_string(),
                tree: words.next().map(|w| w.to_string()),
            },
            "view-page" => Command::ViewPage {
                page: words
                    .next()
                    .and_then(|w| w.parse().ok())
                    .ok_or_else(|| DbError::validation("view-page needs a page number"))?,
            },
            "journal-scan" => Command::JournalScan {
                generation: words.next().and_then(|w| w.parse().ok()),
            },
            "icheck" => Command::Icheck,
            "backup-start" => Command::BackupStart,
            "backup-stop" => Command::BackupStop,
            "help" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => {
                return Err(DbError::validation(&format!(
                    "unrecognized command: {}",
                    other
                )))
            }
        };

        if words.next().is_some() {
            return Err(DbError::validation("trailing arguments"));
        }
        Ok(command)
    }
}

/// Holds the selection state between commands.
#[derive(Default)]
pub struct Shell {
    volume: Option<String>,
    tree: Option<String>,
}

impl Shell {
    pub fn new() -> Shell {
        Shell::default()
    }

    pub fn dispatch(&mut self, command: Command) -> DbResult<String> {
        match command {
            Command::Open { config_path } => {
                let text = std::fs::read_to_string(&config_path)
                    .map_err(|e| DbError::validation(&format!("cannot read config: {}", e)))?;
                let config = crate::config::Config::parse(&text)?;
                Database::init(config)?;
                Ok(format!("opened from {}", config_path))
            }
            Command::Close => {
                Database::close()?;
                Ok("closed".to_string())
            }
            Command::List => {
                let mut out = String::new();
                for volume in Database::volumes() {
                    out.push_str(&format!(
                        "volume {} (handle {}): {} pages, {} reads, {} writes\n",
                        volume.name(),
                        volume.handle(),
                        volume.extended_page_count(),
                        volume.read_counter(),
                        volume.write_counter(),
                    ));
                    for name in Database::tree_names(volume.handle())? {
                        let tree = Database::get_tree(volume.handle(), &name, false)?;
                        let t = tree.rl();
                        out.push_str(&format!(
                            "    tree {}: root {}, depth {}, {} changes\n",
                            name,
                            t.root(),
                            t.depth(),
                            t.change_count(),
                        ));
                    }
                }
                Ok(out)
            }
            Command::Select { volume, tree } => {
                Database::volume_by_name(&volume)?;
                if let Some(tree_name) = &tree {
                    let v = Database::volume_by_name(&volume)?;
                    Database::get_tree(v.handle(), tree_name, false)?;
                }
                self.volume = Some(volume.clone());
                self.tree = tree.clone();
                Ok(format!(
                    "selected volume {}{}",
                    volume,
                    tree.map(|t| format!(", tree {}", t)).unwrap_or_default()
                ))
            }
            Command::ViewPage { page } => {
                let volume = self.selected_volume()?;
                let v = Database::volume_by_name(&volume)?;
                let bytes = v.read_page(page)?;
                Ok(render_page(page, bytes))
            }
            Command::JournalScan { generation } => {
                let prefix = Database::config().journal_path.clone();
                let generation = match generation {
                    Some(g) => g,
                    None => *Database::journal()
                        .list_generations()
                        .last()
                        .ok_or_else(|| DbError::validation("no journal files"))?,
                };
                recovery::scan_to_string(&prefix, generation)
            }
            Command::Icheck => {
                let mut healthy = true;
                let mut out = String::new();
                for volume in Database::volumes() {
                    for name in Database::tree_names(volume.handle())? {
                        let tree = Database::get_tree(volume.handle(), &name, false)?;
                        let mut session = Database::new_session();
                        let report = icheck::check_tree(&tree, &mut session)?;
                        Database::release_session(&mut session);
                        healthy &= report.is_healthy();
                        out.push_str(&format!("{}/{}: {}\n", volume.name(), name, report));
                        for problem in &report.problems {
                            out.push_str(&format!("    !! {}\n", problem));
                        }
                    }
                }
                if healthy {
                    Ok(out)
                } else {
                    Err(DbError::corruption(&format!(
                        "integrity check failed:\n{}",
                        out
                    )))
                }
            }
            Command::BackupStart => {
                Database::set_append_only(true);
                info!("backup window opened");
                Ok("append-only mode on; copy volume and journal files now".to_string())
            }
            Command::BackupStop => {
                Database::set_append_only(false);
                Ok("append-only mode off".to_string())
            }
            Command::Help => Ok("commands: open <config> | close | list | select <volume> [tree] \
                 | view-page <n> | journal-scan [generation] | icheck \
                 | backup-start | backup-stop | quit"
                .to_string()),
            Command::Quit => Ok(String::new()),
        }
    }

    fn selected_volume(&self) -> DbResult<String> {
        self.volume
            .clone()
            .ok_or_else(|| DbError::validation("no volume selected"))
    }
}

fn render_page(address: u64, bytes: Vec<u8>) -> String {
    let page = Page::from_bytes(bytes);
    let mut out = String::new();

    let ptype = match page.page_type() {
        Ok(t) => format!("{:?}", t),
        Err(_) => format!("invalid ({})", page.bytes()[0]),
    };
    out.push_str(&format!(
        "page {}: type {}, right sibling {}, timestamp {}\n",
        address,
        ptype,
        page.right_sibling(),
        page.timestamp(),
    ));

    match page.page_type() {
        Ok(PageType::Data) | Ok(PageType::Index) => {
            out.push_str(&format!(
                "{} keyblocks, alloc {}, free {}\n",
                page.key_count(),
                page.alloc(),
                page.free_space(),
            ));
            if let Ok((records, guard)) = page.decode_records() {
                if !guard.is_empty() {
                    out.push_str(&format!("guard child: {}\n", hex::encode(&guard)));
                }
                for (i, r) in records.iter().enumerate().take(64) {
                    out.push_str(&format!(
                        "  [{}] key {} -> {} bytes{}\n",
                        i,
                        hex::encode(&r.key),
                        r.value.len(),
                        if r.flags & crate::page::page::TB_LONG_RECORD != 0 {
                            " (long record)"
                        } else {
                            ""
                        },
                    ));
                }
                if records.len() > 64 {
                    out.push_str(&format!("  ... {} more\n", records.len() - 64));
                }
            }
        }
        Ok(PageType::LongRecord) => {
            out.push_str(&format!("payload {} bytes\n", page.long_payload().len()));
        }
        _ => {
            out.push_str(&format!(
                "head bytes: {}\n",
                hex::encode(&page.bytes()[..64.min(page.bytes().len())])
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_commands() {
        assert_eq!(
            Command::parse("select main accounts").unwrap(),
            Command::Select {
                volume: "main".to_string(),
                tree: Some("accounts".to_string()),
            }
        );
        assert_eq!(
            Command::parse("view-page 42").unwrap(),
            Command::ViewPage { page: 42 }
        );
        assert_eq!(
            Command::parse("journal-scan").unwrap(),
            Command::JournalScan { generation: None }
        );
        assert!(Command::parse("bogus").is_err());
        assert!(Command::parse("view-page").is_err());
        assert!(Command::parse("list extra").is_err());
    }
}

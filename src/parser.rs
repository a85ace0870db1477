//! Operator command grammar (spec.md 6): a minimal hand-written tokenizer
//! covering exactly the verbs and parameters this actor dispatches against.
//! Scoped deliberately narrow -- the full operator grammar is an external
//! collaborator per spec.md 1; this is the smallest concrete parser that
//! lets `actor::Actor` have something to dispatch.
//!
//! Qualifiers are introduced by `/`; values by `=` with comma-separated
//! vectors (spec.md 6).

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceTarget {
    Tcs,
    Scale,
    M2,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceAction {
    Initialize,
    Status,
    Connect,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OffsetKind {
    Arc,
    Rotator,
    Calibration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedCommand {
    SetFocus {
        value: Option<f64>,
        incremental: bool,
    },
    SetScaleFactor {
        value: Option<f64>,
        multiplicative: bool,
    },
    Track {
        values: Vec<f64>,
        icrs: bool,
        date: Option<String>,
    },
    Offset {
        kind: OffsetKind,
        values: Vec<f64>,
    },
    Device {
        action: DeviceAction,
        target: DeviceTarget,
    },
    /// Halts the scaling ring (spec.md 8: "move then stop" scenario); the
    /// queue's kill rule (`devices::scale::ScaleDevice::new`) cancels any
    /// running `move` once this reaches the device.
    Stop,
    Ping,
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub verb: String,
    pub command: ParsedCommand,
}

/// One token of the base verb split on `/` (qualifiers) and `=` (a single
/// value or comma-separated vector).
struct Head {
    base: String,
    value: Option<Vec<f64>>,
    qualifiers: Vec<String>,
}

fn split_head(token: &str) -> Result<Head, String> {
    let mut qual_parts = token.split('/');
    let first = qual_parts.next().unwrap_or("");
    let qualifiers: Vec<String> = qual_parts.map(|q| q.to_lowercase()).collect();

    let (base, value) = match first.split_once('=') {
        Some((b, v)) => {
            let parsed: Result<Vec<f64>, _> = v.split(',').map(|p| p.trim().parse::<f64>()).collect();
            let parsed = parsed.map_err(|_| format!("invalid numeric value in '{token}'"))?;
            (b.to_string(), Some(parsed))
        }
        None => (first.to_string(), None),
    };
    Ok(Head {
        base,
        value,
        qualifiers,
    })
}

/// Parse one operator command line. Returns `Err(message)` for anything
/// that doesn't match the known grammar (spec.md 6: "Unknown verbs fail
/// with a parse error").
pub fn parse_line(line: &str) -> Result<ParsedLine, String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(ParsedLine {
            verb: String::new(),
            command: ParsedCommand::Empty,
        });
    }

    let mut tokens = trimmed.split_whitespace();
    let verb_token = tokens.next().unwrap();
    let rest: Vec<&str> = tokens.collect();

    match verb_token.to_lowercase().as_str() {
        "ping" => Ok(ParsedLine {
            verb: "ping".into(),
            command: ParsedCommand::Ping,
        }),
        "stop" => Ok(ParsedLine {
            verb: "stop".into(),
            command: ParsedCommand::Stop,
        }),
        "set" => {
            let target = rest
                .first()
                .ok_or_else(|| "set requires a target (focus or scaleFactor)".to_string())?;
            let head = split_head(target)?;
            match head.base.to_lowercase().as_str() {
                "focus" => Ok(ParsedLine {
                    verb: "set focus".into(),
                    command: ParsedCommand::SetFocus {
                        value: head.value.as_ref().and_then(|v| v.first().copied()),
                        incremental: head.qualifiers.iter().any(|q| q == "incremental"),
                    },
                }),
                "scalefactor" => Ok(ParsedLine {
                    verb: "set scaleFactor".into(),
                    command: ParsedCommand::SetScaleFactor {
                        value: head.value.as_ref().and_then(|v| v.first().copied()),
                        multiplicative: head.qualifiers.iter().any(|q| q == "multiplicative"),
                    },
                }),
                other => Err(format!("unknown set target '{other}'")),
            }
        }
        "track" => {
            let values_tok = rest.first().ok_or_else(|| "track requires coordinates".to_string())?;
            let values: Result<Vec<f64>, _> = values_tok.split(',').map(|p| p.trim().parse::<f64>()).collect();
            let values = values.map_err(|_| format!("invalid track coordinates '{values_tok}'"))?;
            let icrs = rest.get(1).is_some_and(|t| t.eq_ignore_ascii_case("icrs"));
            let date = rest.get(2).map(|s| s.to_string());
            Ok(ParsedLine {
                verb: "track".into(),
                command: ParsedCommand::Track { values, icrs, date },
            })
        }
        "offset" => {
            let kind = match rest.first().map(|s| s.to_lowercase()) {
                Some(k) if k == "arc" => OffsetKind::Arc,
                Some(k) if k == "rotator" => OffsetKind::Rotator,
                Some(k) if k == "calibration" => OffsetKind::Calibration,
                _ => return Err("offset requires arc, rotator, or calibration".to_string()),
            };
            let values_tok = rest.get(1).ok_or_else(|| "offset requires values".to_string())?;
            let values: Result<Vec<f64>, _> = values_tok.split(',').map(|p| p.trim().parse::<f64>()).collect();
            let values = values.map_err(|_| format!("invalid offset values '{values_tok}'"))?;
            Ok(ParsedLine {
                verb: "offset".into(),
                command: ParsedCommand::Offset { kind, values },
            })
        }
        "device" => {
            let action = match rest.first().map(|s| s.to_lowercase()) {
                Some(a) if a == "initialize" => DeviceAction::Initialize,
                Some(a) if a == "status" => DeviceAction::Status,
                Some(a) if a == "connect" => DeviceAction::Connect,
                Some(a) if a == "disconnect" => DeviceAction::Disconnect,
                _ => return Err("device requires initialize, status, connect, or disconnect".to_string()),
            };
            let target = match rest.get(1).map(|s| s.to_lowercase()) {
                None => DeviceTarget::All,
                Some(t) if t == "tcs" => DeviceTarget::Tcs,
                Some(t) if t == "scale" => DeviceTarget::Scale,
                Some(t) if t == "m2" => DeviceTarget::M2,
                Some(t) if t == "all" => DeviceTarget::All,
                Some(t) => return Err(format!("unknown device target '{t}'")),
            };
            Ok(ParsedLine {
                verb: "device".into(),
                command: ParsedCommand::Device { action, target },
            })
        }
        other => Err(format!("unrecognized verb '{other}'")),
    }
}

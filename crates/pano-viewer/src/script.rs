//! Line-oriented command language driving the headless viewer.
//!
//! One command per line; blank lines and `#` comments are ignored.
//!
//! ```text
//! drag 40 -10        # pointer drag in pixels
//! right              # arrow keys: left, right, up, down
//! +                  # widen field of view; `-` narrows it
//! resize 1024 512
//! render view.png    # write the current view with HUD
//! status             # log the current yaw, pitch and field of view
//! q                  # quit (also `esc`)
//! ```

use std::path::PathBuf;

use crate::navigation::InputEvent;

#[derive(Clone, Debug, PartialEq)]
pub enum ScriptCommand {
    Input(InputEvent),
    Render(PathBuf),
    Status,
}

pub fn parse_line(line: &str) -> Result<Option<ScriptCommand>, String> {
    let line = line.split('#').next().unwrap_or_default().trim();
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match head {
        "drag" => {
            let [dx, dy] = args.as_slice() else {
                return Err("usage: drag <dx> <dy>".to_string());
            };
            ScriptCommand::Input(InputEvent::Drag {
                dx: parse_number(dx)?,
                dy: parse_number(dy)?,
            })
        }
        "resize" => {
            let [width, height] = args.as_slice() else {
                return Err("usage: resize <width> <height>".to_string());
            };
            let width = parse_dimension(width)?;
            let height = parse_dimension(height)?;
            ScriptCommand::Input(InputEvent::Resize { width, height })
        }
        "render" => match args.as_slice() {
            [path] => ScriptCommand::Render(PathBuf::from(path)),
            _ => return Err("usage: render <path>".to_string()),
        },
        "status" => ScriptCommand::Status,
        key => match InputEvent::from_key(key) {
            Some(event) if args.is_empty() => ScriptCommand::Input(event),
            Some(_) => return Err(format!("`{key}` takes no arguments")),
            None => return Err(format!("unknown command `{key}`")),
        },
    };
    Ok(Some(command))
}

fn parse_number(value: &str) -> Result<f64, String> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("`{value}` is not a number"))
}

fn parse_dimension(value: &str) -> Result<u32, String> {
    match value.parse::<u32>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(format!("`{value}` is not a positive size")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_command_kind() {
        assert_eq!(
            parse_line("drag 40 -10.5").unwrap(),
            Some(ScriptCommand::Input(InputEvent::Drag {
                dx: 40.0,
                dy: -10.5
            }))
        );
        assert_eq!(
            parse_line("  right  # look east").unwrap(),
            Some(ScriptCommand::Input(InputEvent::Right))
        );
        assert_eq!(
            parse_line("-").unwrap(),
            Some(ScriptCommand::Input(InputEvent::NarrowFov))
        );
        assert_eq!(
            parse_line("render out/view.png").unwrap(),
            Some(ScriptCommand::Render(PathBuf::from("out/view.png")))
        );
        assert_eq!(
            parse_line("resize 640 320").unwrap(),
            Some(ScriptCommand::Input(InputEvent::Resize {
                width: 640,
                height: 320
            }))
        );
        assert_eq!(parse_line("status").unwrap(), Some(ScriptCommand::Status));
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert_eq!(parse_line("").unwrap(), None);
        assert_eq!(parse_line("   # nothing here").unwrap(), None);
    }

    #[test]
    fn malformed_lines_are_errors() {
        assert!(parse_line("drag 4").is_err());
        assert!(parse_line("drag a b").is_err());
        assert!(parse_line("drag inf 0").is_err());
        assert!(parse_line("resize 0 10").is_err());
        assert!(parse_line("render").is_err());
        assert!(parse_line("left 5").is_err());
        assert_eq!(parse_line("jump").unwrap_err(), "unknown command `jump`");
    }
}

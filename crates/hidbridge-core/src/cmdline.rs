//! Command-line splitting and DirectShow input repair.
//!
//! Custom pipeline and capture-input strings arrive as a single flat string
//! and have to be split into an argv the way a shell would. On Windows,
//! DirectShow device selectors like `video=USB3.0 Video` survive several
//! launch layers with inconsistent quoting; the normalizer reglues
//! multi-token device names and strips wrapper quotes so ffmpeg receives
//! the raw selector.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CmdlineError {
    #[error("unterminated quote in command line")]
    UnterminatedQuote,
}

/// Split a flat command line into arguments, honoring single/double quotes
/// and backslash escapes. A trailing backslash is kept literally.
pub fn split_command_line(raw: &str) -> Result<Vec<String>, CmdlineError> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quote: Option<char> = None;
    let mut escape = false;

    for ch in raw.chars() {
        if escape {
            cur.push(ch);
            escape = false;
            continue;
        }
        if let Some(q) = quote {
            match ch {
                '\\' => escape = true,
                c if c == q => quote = None,
                c => cur.push(c),
            }
            continue;
        }
        match ch {
            c if c.is_whitespace() => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
            }
            '"' | '\'' => quote = Some(ch),
            '\\' => escape = true,
            c => cur.push(c),
        }
    }

    if escape {
        cur.push('\\');
    }
    if quote.is_some() {
        return Err(CmdlineError::UnterminatedQuote);
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    Ok(out)
}

/// True when the argv selects the DirectShow input format (`-f dshow`).
pub fn uses_dshow_input(args: &[String]) -> bool {
    args.windows(2)
        .any(|w| w[0].eq_ignore_ascii_case("-f") && w[1].eq_ignore_ascii_case("dshow"))
}

/// Insert `-key value` before `-i ...` unless the key is already present.
pub fn ensure_dshow_capture_arg(args: &[String], key: &str, value: &str) -> Vec<String> {
    if args.iter().any(|a| a.eq_ignore_ascii_case(key)) {
        return args.to_vec();
    }

    let insert_at = args
        .iter()
        .position(|a| a.eq_ignore_ascii_case("-i"))
        .unwrap_or(args.len());

    let mut out = Vec::with_capacity(args.len() + 2);
    out.extend_from_slice(&args[..insert_at]);
    out.push(key.to_string());
    out.push(value.to_string());
    out.extend_from_slice(&args[insert_at..]);
    out
}

/// Replace the value of an existing `-key value` pair, or insert the pair
/// before `-i ...` if missing.
pub fn upsert_dshow_capture_arg(args: &[String], key: &str, value: &str) -> Vec<String> {
    for i in 0..args.len().saturating_sub(1) {
        if args[i].eq_ignore_ascii_case(key) {
            let mut out = args.to_vec();
            out[i + 1] = value.to_string();
            return out;
        }
    }
    ensure_dshow_capture_arg(args, key, value)
}

/// Repair DirectShow input arguments.
///
/// Unquoted multi-word device names after `-i video=` get tokenized apart
/// upstream; reglue them until the next `-flag` or `key=value` token, then
/// strip wrapper quotes from the selector.
pub fn normalize_dshow_input_args(args: &[String]) -> Vec<String> {
    if args.len() < 4 || !uses_dshow_input(args) {
        return args.to_vec();
    }

    let mut out = Vec::with_capacity(args.len());
    let mut i = 0;
    while i < args.len() {
        if args[i].eq_ignore_ascii_case("-i") && i + 1 < args.len() {
            let mut input_val = args[i + 1].clone();
            out.push(args[i].clone());

            if input_val.to_ascii_lowercase().starts_with("video=") {
                let mut j = i + 2;
                while j < args.len() {
                    let next = &args[j];
                    if next.starts_with('-') || next.contains('=') {
                        break;
                    }
                    input_val.push(' ');
                    input_val.push_str(next);
                    j += 1;
                }
                out.push(normalize_dshow_device_selector(&input_val));
                i = j;
                continue;
            }

            out.push(input_val);
            i += 2;
            continue;
        }

        out.push(args[i].clone());
        i += 1;
    }

    out
}

/// Strip escaped and plain wrapper quotes from a `video=` device selector.
/// ffmpeg receives argv entries verbatim, so any quoting that survived the
/// launch layers would become part of the device name.
pub fn normalize_dshow_device_selector(input_val: &str) -> String {
    if !input_val.to_ascii_lowercase().starts_with("video=") {
        return input_val.to_string();
    }

    let mut val = input_val["video=".len()..].trim().to_string();
    if val.is_empty() {
        return input_val.to_string();
    }

    val = val.replace("\\\"", "\"").replace("\\'", "'");
    loop {
        let stripped = if val.len() >= 2 && val.starts_with('"') && val.ends_with('"') {
            val[1..val.len() - 1].trim().to_string()
        } else if val.len() >= 2 && val.starts_with('\'') && val.ends_with('\'') {
            val[1..val.len() - 1].trim().to_string()
        } else {
            break;
        };
        val = stripped;
    }

    format!("video={val}")
}

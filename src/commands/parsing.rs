use crate::config::SamplingRequest;

/// Splits a START* payload into its parameter line and the prompt after it.
pub(crate) fn parse_start_payload(payload: &[u8]) -> Result<(SamplingRequest, String), String> {
    let text = String::from_utf8(payload.to_vec()).map_err(|_| "START payload must be valid UTF-8".to_string())?;
    let (params, prompt) = text
        .split_once('\n')
        .ok_or_else(|| "START payload needs a parameter line, then the prompt".to_string())?;
    if prompt.is_empty() {
        return Err("START prompt is empty".to_string());
    }
    let request = parse_sampling_line(params.trim())?;
    Ok((request, prompt.to_string()))
}

pub(crate) fn parse_sampling_line(line: &str) -> Result<SamplingRequest, String> {
    let mut request = SamplingRequest::default();

    for pair in line.split([',', ';', ' ']) {
        let item = pair.trim();
        if item.is_empty() {
            continue;
        }

        let (key, value) = item
            .split_once('=')
            .ok_or_else(|| format!("Invalid item '{}'. Expected key=value", item))?;
        let key = key.trim().to_lowercase();
        let value = value.trim();

        match key.as_str() {
            "temperature" | "temp" => {
                let parsed: f32 = value
                    .parse()
                    .map_err(|_| format!("Invalid temperature '{}'.", value))?;
                if !(0.0..=2.0).contains(&parsed) {
                    return Err("temperature must be in [0.0, 2.0]".to_string());
                }
                request.temperature = Some(parsed);
            }
            "top_p" | "topp" => {
                let parsed: f32 = value
                    .parse()
                    .map_err(|_| format!("Invalid top_p '{}'.", value))?;
                if !(0.0..=1.0).contains(&parsed) {
                    return Err("top_p must be in [0.0, 1.0]".to_string());
                }
                request.top_p = Some(parsed);
            }
            "top_k" | "topk" => {
                request.top_k = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid top_k '{}'.", value))?,
                );
            }
            "max_tokens" | "max_new_tokens" => {
                let parsed: usize = value
                    .parse()
                    .map_err(|_| format!("Invalid max_tokens '{}'.", value))?;
                if parsed == 0 {
                    return Err("max_tokens must be > 0".to_string());
                }
                request.max_tokens = Some(parsed);
            }
            _ => return Err(format!("Unknown sampling key '{}'.", key)),
        }
    }

    Ok(request)
}

pub(crate) fn parse_count(payload: &[u8]) -> Result<usize, String> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();
    match text.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("NEXTN payload must be a positive count, got '{}'", text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_payload_with_parameters() {
        let (request, prompt) =
            parse_start_payload(b"temperature=0.2,top_k=5 max_tokens=12\nHello\nthere").expect("payload");
        assert_eq!(request.temperature, Some(0.2));
        assert_eq!(request.top_k, Some(5));
        assert_eq!(request.max_tokens, Some(12));
        assert_eq!(request.top_p, None);
        assert_eq!(prompt, "Hello\nthere");
    }

    #[test]
    fn empty_parameter_line_keeps_defaults() {
        let (request, prompt) = parse_start_payload(b"\nhi").expect("payload");
        assert_eq!(request, SamplingRequest::default());
        assert_eq!(prompt, "hi");
    }

    #[test]
    fn rejects_out_of_range_and_unknown_keys() {
        assert!(parse_sampling_line("temperature=3").is_err());
        assert!(parse_sampling_line("top_p=1.5").is_err());
        assert!(parse_sampling_line("max_tokens=0").is_err());
        assert!(parse_sampling_line("seed=4").is_err());
        assert!(parse_sampling_line("top_k").is_err());
    }

    #[test]
    fn payload_without_prompt_is_rejected() {
        assert!(parse_start_payload(b"temperature=0.1").is_err());
        assert!(parse_start_payload(b"temperature=0.1\n").is_err());
    }

    #[test]
    fn count_must_be_positive() {
        assert_eq!(parse_count(b" 8 "), Ok(8));
        assert!(parse_count(b"0").is_err());
        assert!(parse_count(b"many").is_err());
    }
}

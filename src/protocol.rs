#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Ping,
    Load,
    Unload,
    Loaded,
    Info,
    Start,
    StartIncremental,
    StartThreaded,
    Next,
    NextN,
    Buffered,
    Generating,
    Stop,
    Clear,
    Cached,
    Stats,
    ResetStats,
    MemInfo,
    MemUsage,
    Status,
    Shutdown,
}

impl OpCode {
    fn from_verb(verb: &str) -> Option<Self> {
        let op = match verb.to_uppercase().as_str() {
            "PING" => Self::Ping,
            "LOAD" => Self::Load,
            "UNLOAD" => Self::Unload,
            "LOADED" => Self::Loaded,
            "INFO" => Self::Info,
            "START" => Self::Start,
            "START_INC" => Self::StartIncremental,
            "START_THREADED" => Self::StartThreaded,
            "NEXT" => Self::Next,
            "NEXTN" => Self::NextN,
            "BUFFERED" => Self::Buffered,
            "GENERATING" => Self::Generating,
            "STOP" => Self::Stop,
            "CLEAR" => Self::Clear,
            "CACHED" => Self::Cached,
            "STATS" => Self::Stats,
            "RESET_STATS" => Self::ResetStats,
            "MEMINFO" => Self::MemInfo,
            "MEMUSAGE" => Self::MemUsage,
            "STATUS" => Self::Status,
            "SHUTDOWN" => Self::Shutdown,
            _ => return None,
        };
        Some(op)
    }
}

#[derive(Debug, Clone)]
pub struct CommandHeader {
    pub opcode: OpCode,
    pub tag: String,
    pub content_length: usize,
}

impl CommandHeader {
    /// Parses `VERB <tag> <length>`. Tag and length are optional.
    pub fn parse(line: &str) -> Result<Self, String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(verb) = parts.first() else {
            return Err("Empty header".to_string());
        };

        let opcode = OpCode::from_verb(verb).ok_or_else(|| format!("Unknown opcode: {}", verb))?;
        let tag = parts.get(1).map(|t| t.to_string()).unwrap_or_else(|| "sys".to_string());
        let content_length = match parts.get(2) {
            Some(len) => len
                .parse::<usize>()
                .map_err(|_| format!("Invalid content length '{}'", len))?,
            None => 0,
        };

        Ok(Self {
            opcode,
            tag,
            content_length,
        })
    }
}

fn framed(prefix: &str, code: &str, body: &str) -> Vec<u8> {
    let mut out = format!("{} {} {}\r\n", prefix, code, body.len()).into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

pub fn response_ok_code(code: &str, body: &str) -> Vec<u8> {
    framed("+OK", code, body)
}

pub fn response_err_code(code: &str, body: &str) -> Vec<u8> {
    framed("-ERR", code, body)
}

/// One streamed chunk pushed to the client that started the stream.
pub fn response_data(data: &[u8]) -> Vec<u8> {
    let mut out = format!("DATA {}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out
}

pub fn response_stream_end() -> Vec<u8> {
    response_ok_code("STREAM_END", "")
}

use serde_json::Value;

/** \brief 流式响应的终止标记。 */
pub const DONE_SENTINEL: &str = "[DONE]";

/**
 * \brief 解码器所处阶段。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPhase {
    /** \brief 等待更多字节 */
    #[default]
    Streaming,
    /** \brief 收到终止标记或输入结束 */
    Done,
    /** \brief 传输层失败，由驱动方标记 */
    Failed,
}

/**
 * \brief 单次 feed 的产出：按到达顺序排列的增量文本，以及是否已见到终止标记。
 */
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Feed {
    pub deltas: Vec<String>,
    pub done: bool,
}

/**
 * \brief SSE 增量解码器（纯状态机，无 I/O）。
 * \details 以 `(state, chunk) -> (state', deltas)` 的方式逐块喂入原始字节：
 *          跨块保留不完整的 UTF-8 序列与未结束的行，空行分隔事件帧；
 *          单帧 JSON 解析失败只记录并跳过，不中断整个流。
 */
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending_bytes: Vec<u8>,
    line_buf: String,
    data_lines: Vec<String>,
    event: Option<String>,
    phase: StreamPhase,
    skipped: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    /** \brief 被跳过的畸形帧数量。 */
    pub fn skipped_frames(&self) -> usize {
        self.skipped
    }

    /** \brief 传输层失败时由驱动方调用。 */
    pub fn fail(&mut self) {
        self.phase = StreamPhase::Failed;
    }

    /**
     * \brief 喂入一块原始字节，返回本块中完整帧产生的增量。
     */
    pub fn feed(&mut self, chunk: &[u8]) -> Feed {
        let mut out = Feed::default();
        if self.phase != StreamPhase::Streaming {
            out.done = self.phase == StreamPhase::Done;
            return out;
        }
        let text = self.decode_utf8(chunk);
        self.line_buf.push_str(&text);
        self.drain_lines(&mut out);
        out
    }

    /**
     * \brief 输入结束：冲刷残留字节、未结束的行与未以空行收尾的最后一帧。
     */
    pub fn finish(&mut self) -> Feed {
        let mut out = Feed::default();
        if self.phase != StreamPhase::Streaming {
            out.done = self.phase == StreamPhase::Done;
            return out;
        }
        if !self.pending_bytes.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending_bytes).into_owned();
            self.pending_bytes.clear();
            self.line_buf.push_str(&tail);
        }
        self.drain_lines(&mut out);
        if self.phase == StreamPhase::Streaming && !self.line_buf.is_empty() {
            let line = std::mem::take(&mut self.line_buf);
            self.process_line(line.trim_end_matches('\r'), &mut out);
        }
        if self.phase == StreamPhase::Streaming {
            self.dispatch(&mut out);
        }
        self.phase = StreamPhase::Done;
        out.done = true;
        out
    }

    fn decode_utf8(&mut self, chunk: &[u8]) -> String {
        self.pending_bytes.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending_bytes) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending_bytes.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending_bytes[..valid]));
                    match e.error_len() {
                        // 不完整的多字节序列，留待下一块补齐
                        None => {
                            self.pending_bytes.drain(..valid);
                            break;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending_bytes.drain(..valid + bad);
                        }
                    }
                }
            }
        }
        out
    }

    fn drain_lines(&mut self, out: &mut Feed) {
        while self.phase == StreamPhase::Streaming {
            let Some((pos, len)) = next_line_end(&self.line_buf) else {
                break;
            };
            let line = self.line_buf[..pos].to_string();
            self.line_buf.drain(..pos + len);
            self.process_line(&line, out);
        }
        if self.phase == StreamPhase::Done {
            self.line_buf.clear();
            out.done = true;
        }
    }

    fn process_line(&mut self, line: &str, out: &mut Feed) {
        if line.is_empty() {
            self.dispatch(out);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data_lines.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self, out: &mut Feed) {
        let event = self.event.take();
        if self.data_lines.is_empty() {
            return;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();

        if data.trim() == DONE_SENTINEL {
            self.phase = StreamPhase::Done;
            out.done = true;
            return;
        }
        match parse_delta(&data) {
            Ok(Some(delta)) => out.deltas.push(delta),
            Ok(None) => {}
            Err(err) => {
                self.skipped += 1;
                tracing::warn!(
                    event = event.as_deref().unwrap_or("message"),
                    "skip malformed stream frame: {}",
                    err
                );
            }
        }
    }
}

/**
 * \brief 查找首个行结束符 `\r\n`、`\n` 或单独的 `\r`，返回 (位置, 长度)。
 * \details 缓冲区末尾的 `\r` 可能是被拆开的 `\r\n`，须等下一块再判定。
 */
fn next_line_end(buf: &str) -> Option<(usize, usize)> {
    let pos = buf.find(|c| c == '\r' || c == '\n')?;
    let bytes = buf.as_bytes();
    if bytes[pos] == b'\n' {
        return Some((pos, 1));
    }
    match bytes.get(pos + 1) {
        Some(b'\n') => Some((pos, 2)),
        Some(_) => Some((pos, 1)),
        None => None,
    }
}

/**
 * \brief 从单帧 JSON 中提取 `choices[0].delta.content`；空串视为无增量。
 */
pub fn parse_delta(data: &str) -> Result<Option<String>, serde_json::Error> {
    let v: Value = serde_json::from_str(data)?;
    Ok(v.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string()))
}

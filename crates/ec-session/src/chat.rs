use ec_backend::{ChatMessage, Context, Model};
use tracing::{debug, error, warn};

use crate::error::{Result, SessionError};

/// Render `messages` with the model's chat template, followed by the
/// assistant prefix.
///
/// The buffer starts at `n_ctx` bytes and is grown to the length the
/// renderer reports, then rendered again.
///
/// The whole list is rendered once, after all messages are collected,
/// instead of after each appended message. The resulting prompt is the same.
pub fn format_chat<C: Context>(ctx: &C, messages: &[ChatMessage]) -> Result<String> {
    let model = ctx.model();
    let mut buf = vec![0u8; (ctx.n_ctx() as usize).max(1)];

    let mut len = render(model, messages, &mut buf)?;
    if len > buf.len() {
        debug!(from = buf.len(), to = len, "growing chat template buffer");
        buf.resize(len, 0);
        len = render(model, messages, &mut buf)?;
    }
    buf.truncate(len.min(buf.len()));

    let prompt = match String::from_utf8(buf) {
        Ok(s) => s,
        Err(e) => {
            warn!("chat template produced invalid UTF-8");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    };
    debug!(n_messages = messages.len(), prompt = %prompt, "formatted chat");
    Ok(prompt)
}

fn render<M: Model>(model: &M, messages: &[ChatMessage], buf: &mut [u8]) -> Result<usize> {
    let code = model.apply_chat_template(messages, true, buf);
    usize::try_from(code).map_err(|_| {
        error!(code, "failed to apply the chat template");
        SessionError::Template { code }
    })
}

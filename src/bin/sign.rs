//! Prints the signed request path for a resize message.
//!
//! ```text
//! SECURITY_KEY=secret thumbproxy-sign 300x0/https://example.com/photo.jpg
//! ```

use thumbproxy::signature::{sign, signed_path};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let secret = std::env::var("SECURITY_KEY").map_err(|_| "SECURITY_KEY must be set")?;
    let mut messages = std::env::args().skip(1).peekable();
    if messages.peek().is_none() {
        return Err("usage: thumbproxy-sign <WxH>/<source-url> [...]".into());
    }

    for message in messages {
        let message = message.trim_start_matches('/');
        println!("signature: {}", sign(secret.as_bytes(), message)?);
        println!("path:      {}", signed_path(secret.as_bytes(), message)?);
    }
    Ok(())
}

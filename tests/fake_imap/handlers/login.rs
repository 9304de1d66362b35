//! LOGIN command handler.
//!
//! async-imap sends both arguments as quoted strings, so the line is
//! tokenized here instead of going through the command codec.

use crate::fake_imap::io::respond;
use crate::fake_imap::server::ServerOptions;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Split IMAP arguments into atoms and unescaped quoted strings.
pub fn parse_arguments(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = args.trim().chars().peekable();
    while let Some(&c) = chars.peek() {
        if c == ' ' {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut value = String::new();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => value.extend(chars.next()),
                    '"' => break,
                    c => value.push(c),
                }
            }
            out.push(value);
        } else {
            let mut value = String::new();
            while let Some(&c) = chars.peek() {
                if c == ' ' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            out.push(value);
        }
    }
    out
}

/// Handle LOGIN. Returns whether the client is now authenticated.
pub async fn handle_login<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    args: &str,
    options: &ServerOptions,
    stream: &mut BufReader<S>,
) -> bool {
    let parts = parse_arguments(args);
    let accepted = parts.len() == 2 && parts[0] == options.username && parts[1] == options.password;
    if accepted {
        let _ = respond(stream, tag, "OK", "LOGIN completed").await;
    } else {
        let _ = respond(stream, tag, "NO", "[AUTHENTICATIONFAILED] Invalid credentials").await;
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn run(tag: &str, args: &str) -> (String, bool) {
        let (client, server) = tokio::io::duplex(1024);
        let mut stream = BufReader::new(server);

        let ok = handle_login(tag, args, &ServerOptions::default(), &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        (String::from_utf8(buf).unwrap(), ok)
    }

    #[tokio::test]
    async fn accepts_configured_credentials() {
        let (output, ok) = run("A0001", r#""testuser" "testpass""#).await;
        assert!(ok);
        assert_eq!(output, "A0001 OK LOGIN completed\r\n");
    }

    #[tokio::test]
    async fn rejects_wrong_password() {
        let (output, ok) = run("A0001", r#""testuser" "nope""#).await;
        assert!(!ok);
        assert!(output.starts_with("A0001 NO [AUTHENTICATIONFAILED]"));
    }

    #[test]
    fn parses_quoted_and_atom_arguments() {
        assert_eq!(
            parse_arguments(r#"plain "with \"quote\"" "a\\b""#),
            vec!["plain", "with \"quote\"", "a\\b"]
        );
    }
}

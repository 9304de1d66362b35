//! LIST command handler.
//!
//! One `* LIST` line per folder, with the RFC 6154 special-use
//! attribute where the folder has one:
//!
//! ```text
//! * LIST (\HasNoChildren) "/" "INBOX"
//! * LIST (\HasNoChildren \All) "/" "Archive"
//! A0002 OK LIST completed
//! ```

use crate::fake_imap::io::{respond, write_line};
use crate::fake_imap::mailbox::Mailbox;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Handle the LIST command. Emits one `* LIST` line per folder.
pub async fn handle_list<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    mailbox: &Mailbox,
    stream: &mut BufReader<S>,
) {
    for folder in &mailbox.folders {
        let attributes = folder
            .special_use
            .as_ref()
            .map_or_else(
                || "\\HasNoChildren".to_string(),
                |attr| format!("\\HasNoChildren {attr}"),
            );
        let line = format!("* LIST ({attributes}) \"/\" \"{}\"\r\n", folder.name);
        if write_line(stream, &line).await.is_err() {
            return;
        }
    }
    let _ = respond(stream, tag, "OK", "LIST completed").await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::mailbox::MailboxBuilder;
    use tokio::io::BufReader;

    async fn run(tag: &str, mailbox: &Mailbox) -> String {
        let (client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);

        handle_list(tag, mailbox, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn lists_all_folders() {
        let mailbox = MailboxBuilder::new().folder("INBOX").folder("Sent").build();

        let output = run("A1", &mailbox).await;

        assert!(output.contains("* LIST (\\HasNoChildren) \"/\" \"INBOX\""));
        assert!(output.contains("\"Sent\""));
        assert!(output.ends_with("A1 OK LIST completed\r\n"));
    }

    #[tokio::test]
    async fn marks_special_use_folder() {
        let mailbox = MailboxBuilder::new()
            .folder("INBOX")
            .special_folder("Archive", "\\All")
            .build();

        let output = run("A1", &mailbox).await;

        assert!(output.contains("* LIST (\\HasNoChildren \\All) \"/\" \"Archive\""));
    }

    #[tokio::test]
    async fn empty_mailbox_returns_only_ok() {
        let output = run("T2", &MailboxBuilder::new().build()).await;
        assert_eq!(output, "T2 OK LIST completed\r\n");
    }
}

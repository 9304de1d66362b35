//! EXPUNGE and UID EXPUNGE handlers.
//!
//! Both remove messages flagged `\Deleted` from the selected folder and
//! send `* N EXPUNGE` for each, where N is the sequence number at the
//! time of removal. UID EXPUNGE (RFC 4315) only touches the given UIDs.

use crate::fake_imap::io::{respond, write_line};
use crate::fake_imap::mailbox::{Folder, Mailbox};
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Remove deleted messages accepted by `only`; returns the sequence
/// numbers to report.
pub fn expunge_folder(folder: &mut Folder, only: impl Fn(u32) -> bool) -> Vec<usize> {
    let mut seqs = Vec::new();
    let mut idx = 0;
    while idx < folder.emails.len() {
        let email = &folder.emails[idx];
        if email.deleted && only(email.uid) {
            folder.emails.remove(idx);
            seqs.push(idx + 1);
        } else {
            idx += 1;
        }
    }
    seqs
}

/// Parse a UID set such as `4`, `1,3` or `2:5`.
pub fn parse_uid_set(set: &str) -> Vec<(u32, u32)> {
    set.trim()
        .split(',')
        .filter_map(|part| match part.split_once(':') {
            Some((a, b)) => {
                let (a, b): (u32, u32) = (a.parse().ok()?, b.parse().unwrap_or(u32::MAX));
                Some((a.min(b), a.max(b)))
            }
            None => part.parse().ok().map(|v| (v, v)),
        })
        .collect()
}

async fn run<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    command: &str,
    mailbox: &Mutex<Mailbox>,
    selected_folder: Option<&str>,
    stream: &mut BufReader<S>,
    only: impl Fn(u32) -> bool,
) {
    let Some(folder_name) = selected_folder else {
        let _ = respond(stream, tag, "BAD", "No folder selected").await;
        return;
    };

    let expunged = {
        let mut mb = mailbox.lock().unwrap();
        let seqs = mb.get_folder_mut(folder_name).map(|f| expunge_folder(f, only));
        drop(mb);
        seqs
    };
    let Some(expunged) = expunged else {
        let _ = respond(stream, tag, "BAD", "Folder not found").await;
        return;
    };

    for seq in &expunged {
        if write_line(stream, &format!("* {seq} EXPUNGE\r\n")).await.is_err() {
            return;
        }
    }
    let _ = respond(stream, tag, "OK", &format!("{command} completed")).await;
}

/// Handle EXPUNGE: remove every `\Deleted` message.
pub async fn handle_expunge<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    mailbox: &Mutex<Mailbox>,
    selected_folder: Option<&str>,
    stream: &mut BufReader<S>,
) {
    run(tag, "EXPUNGE", mailbox, selected_folder, stream, |_| true).await;
}

/// Handle UID EXPUNGE: remove `\Deleted` messages within `uid_set`.
pub async fn handle_uid_expunge<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    uid_set: &str,
    mailbox: &Mutex<Mailbox>,
    selected_folder: Option<&str>,
    stream: &mut BufReader<S>,
) {
    let ranges = parse_uid_set(uid_set);
    if ranges.is_empty() {
        let _ = respond(stream, tag, "BAD", "Invalid UID set").await;
        return;
    }
    run(tag, "UID EXPUNGE", mailbox, selected_folder, stream, |uid| {
        ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&uid))
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::mailbox::MailboxBuilder;
    use tokio::io::BufReader;

    const RAW: &[u8] = b"From: a@b.com\r\nSubject: Test\r\n\r\nBody";

    /// UIDs 1..=3, with 1 and 3 flagged `\Deleted`.
    fn mailbox() -> Mutex<Mailbox> {
        let mut mb = MailboxBuilder::new()
            .folder("INBOX")
            .email(1, false, RAW)
            .email(2, false, RAW)
            .email(3, false, RAW)
            .build();
        let inbox = mb.get_folder_mut("INBOX").unwrap();
        inbox.emails[0].deleted = true;
        inbox.emails[2].deleted = true;
        Mutex::new(mb)
    }

    async fn output(client: tokio::io::DuplexStream) -> String {
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn expunge_removes_all_deleted() {
        let mb = mailbox();
        let (client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);
        handle_expunge("A1", &mb, Some("INBOX"), &mut stream).await;
        drop(stream);

        // UID 3 is at sequence 2 once UID 1 is gone.
        assert_eq!(
            output(client).await,
            "* 1 EXPUNGE\r\n* 2 EXPUNGE\r\nA1 OK EXPUNGE completed\r\n"
        );
        assert_eq!(mb.lock().unwrap().uids("INBOX"), vec![2]);
    }

    #[tokio::test]
    async fn uid_expunge_only_touches_given_uids() {
        let mb = mailbox();
        let (client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);
        handle_uid_expunge("A1", "3", &mb, Some("INBOX"), &mut stream).await;
        drop(stream);

        assert_eq!(output(client).await, "* 3 EXPUNGE\r\nA1 OK UID EXPUNGE completed\r\n");
        assert_eq!(mb.lock().unwrap().uids("INBOX"), vec![1, 2]);
    }

    #[tokio::test]
    async fn no_folder_selected_returns_bad() {
        let mb = mailbox();
        let (client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);
        handle_expunge("A1", &mb, None, &mut stream).await;
        drop(stream);

        assert!(output(client).await.contains("A1 BAD No folder selected"));
    }

    #[test]
    fn parses_uid_sets() {
        assert_eq!(parse_uid_set("4"), vec![(4, 4)]);
        assert_eq!(parse_uid_set("1,5:3"), vec![(1, 1), (3, 5)]);
        assert_eq!(parse_uid_set("7:*"), vec![(7, u32::MAX)]);
        assert!(parse_uid_set("x").is_empty());
    }
}

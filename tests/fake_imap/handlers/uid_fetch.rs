//! UID FETCH command handler.
//!
//! Whatever items are requested, the server answers with the UID, the
//! message size and the header block as a counted literal, which is
//! what an envelope lookup needs:
//!
//! ```text
//! * <seq> FETCH (UID <uid> RFC822.SIZE <size> BODY[HEADER] {<len>}
//! <exactly len bytes of header>
//! )
//! ```

use crate::fake_imap::io::{respond, write_literal};
use crate::fake_imap::mailbox::Mailbox;
use imap_codec::imap_types::sequence::SequenceSet;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Expand a sequence set of UIDs, resolving `*` to `max_uid`.
pub fn extract_uids(seq_set: &SequenceSet, max_uid: u32) -> Vec<u32> {
    use imap_codec::imap_types::sequence::{SeqOrUid, Sequence};

    let value = |s: &SeqOrUid| match s {
        SeqOrUid::Value(v) => v.get(),
        SeqOrUid::Asterisk => max_uid,
    };
    let mut uids = Vec::new();
    for seq in seq_set.0.as_ref() {
        match seq {
            Sequence::Single(s) => uids.push(value(s)),
            Sequence::Range(a, b) => {
                let (lo, hi) = (value(a).min(value(b)), value(a).max(value(b)));
                uids.extend(lo..=hi);
            }
        }
    }
    uids
}

/// Handle the UID FETCH command.
pub async fn handle_uid_fetch<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    sequence_set: &SequenceSet,
    mailbox: &Mailbox,
    selected_folder: Option<&str>,
    stream: &mut BufReader<S>,
) {
    let Some(folder_name) = selected_folder else {
        let _ = respond(stream, tag, "BAD", "No folder selected").await;
        return;
    };
    let Some(folder) = mailbox.get_folder(folder_name) else {
        let _ = respond(stream, tag, "BAD", "Folder not found").await;
        return;
    };

    let max_uid = folder.emails.iter().map(|e| e.uid).max().unwrap_or(0);
    for uid in extract_uids(sequence_set, max_uid) {
        let Some((idx, email)) = folder.emails.iter().enumerate().find(|(_, e)| e.uid == uid) else {
            continue;
        };
        let prefix = format!(
            "* {} FETCH (UID {uid} RFC822.SIZE {} BODY[HEADER] ",
            idx + 1,
            email.raw.len()
        );
        if write_literal(stream, &prefix, email.header_block(), ")\r\n")
            .await
            .is_err()
        {
            return;
        }
    }

    let _ = respond(stream, tag, "OK", "FETCH completed").await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::mailbox::MailboxBuilder;
    use imap_codec::imap_types::sequence::{SeqOrUid, Sequence};
    use std::num::NonZeroU32;
    use tokio::io::BufReader;

    const RAW: &[u8] = b"From: a@b.com\r\nSubject: Test\r\n\r\nBody text";

    fn uid_set(uid: u32) -> SequenceSet {
        SequenceSet(
            vec![Sequence::Single(SeqOrUid::Value(NonZeroU32::new(uid).unwrap()))]
                .try_into()
                .unwrap(),
        )
    }

    async fn run(sequence_set: &SequenceSet, mailbox: &Mailbox, selected: Option<&str>) -> String {
        let (client, server) = tokio::io::duplex(4096);
        let mut stream = BufReader::new(server);

        handle_uid_fetch("A1", sequence_set, mailbox, selected, &mut stream).await;
        drop(stream);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut BufReader::new(client), &mut buf)
            .await
            .unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn returns_header_literal_and_size() {
        let mailbox = MailboxBuilder::new().folder("INBOX").email(42, false, RAW).build();

        let output = run(&uid_set(42), &mailbox, Some("INBOX")).await;

        let header_len = b"From: a@b.com\r\nSubject: Test\r\n\r\n".len();
        assert!(output.starts_with(&format!(
            "* 1 FETCH (UID 42 RFC822.SIZE {} BODY[HEADER] {{{header_len}}}\r\n",
            RAW.len()
        )));
        assert!(!output.contains("Body text"));
        assert!(output.ends_with(")\r\nA1 OK FETCH completed\r\n"));
    }

    #[tokio::test]
    async fn missing_uid_returns_only_ok() {
        let mailbox = MailboxBuilder::new().folder("INBOX").build();
        let output = run(&uid_set(99), &mailbox, Some("INBOX")).await;
        assert_eq!(output, "A1 OK FETCH completed\r\n");
    }

    #[tokio::test]
    async fn no_folder_selected_returns_bad() {
        let mailbox = MailboxBuilder::new().folder("INBOX").build();
        let output = run(&uid_set(1), &mailbox, None).await;
        assert!(output.contains("A1 BAD No folder selected"));
    }

    #[test]
    fn expands_ranges() {
        let set = SequenceSet(
            vec![Sequence::Range(
                SeqOrUid::Value(NonZeroU32::new(3).unwrap()),
                SeqOrUid::Asterisk,
            )]
            .try_into()
            .unwrap(),
        );
        assert_eq!(extract_uids(&set, 5), vec![3, 4, 5]);
    }
}

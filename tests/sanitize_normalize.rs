use deskpoll::sanitize::normalize;

#[test]
fn normalize_extracts_threading_headers_and_attachments() {
    let raw = concat!(
        "From: \"Alice Example\" <Alice@Customer.Test>\r\n",
        "Subject: Invoice question\r\n",
        "Date: Fri, 01 Mar 2024 10:00:00 +0000\r\n",
        "Message-ID: <m2@mail.test>\r\n",
        "In-Reply-To: <m1@mail.test>\r\n",
        "References: <m0@mail.test>\r\n <m1@mail.test>\r\n",
        "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
        "\r\n",
        "--b\r\n",
        "Content-Type: text/plain; charset=utf-8\r\n",
        "\r\n",
        "Hello\r\n",
        "--b\r\n",
        "Content-Type: application/pdf; name=\"file.pdf\"\r\n",
        "Content-Disposition: attachment; filename=\"file.pdf\"\r\n",
        "Content-Transfer-Encoding: base64\r\n",
        "\r\n",
        "SGVsbG8=\r\n",
        "--b--\r\n",
    )
    .as_bytes()
    .to_vec();

    let message = normalize(&raw, "42:7", 0).expect("normalize");

    assert_eq!(message.external_id, "42:7");
    assert_eq!(message.from_address, "alice@customer.test");
    assert_eq!(message.from_name.as_deref(), Some("Alice Example"));
    assert_eq!(message.subject, "Invoice question");
    assert_eq!(message.received_at, 1_709_287_200);
    assert_eq!(message.body_text, "Hello");
    assert_eq!(message.message_id.as_deref(), Some("m2@mail.test"));
    assert_eq!(message.in_reply_to.as_deref(), Some("m1@mail.test"));
    assert_eq!(message.references, vec!["m0@mail.test", "m1@mail.test"]);
    assert_eq!(message.parent_keys(), vec!["m1@mail.test", "m0@mail.test"]);

    assert_eq!(message.attachments.len(), 1);
    let attachment = &message.attachments[0];
    assert_eq!(attachment.filename, "file.pdf");
    assert_eq!(attachment.content_type, "application/pdf");
    assert_eq!(attachment.content, b"Hello");
}

#[test]
fn html_only_message_gets_text_rendering() {
    let raw = concat!(
        "From: bob@example.com\r\n",
        "Content-Type: text/html; charset=utf-8\r\n",
        "\r\n",
        "<p>Printer is <b>down</b></p>\r\n",
    )
    .as_bytes()
    .to_vec();

    let message = normalize(&raw, "ext-1", 1_700_000_000).expect("normalize");
    assert_eq!(message.subject, "(No Subject)");
    assert_eq!(message.received_at, 1_700_000_000);
    assert!(message.body_html.as_deref().unwrap_or_default().contains("<b>down</b>"));
    assert!(message.body_text.contains("Printer is"));
    assert!(message.body_text.contains("down"));
    assert_eq!(message.thread_key(), "ext-1");
}

#[test]
fn message_without_sender_is_rejected() {
    let raw = b"Subject: orphan\r\n\r\nno from header\r\n".to_vec();
    assert!(normalize(&raw, "ext-2", 0).is_err());
}

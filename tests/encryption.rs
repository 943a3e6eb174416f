//! Encrypt on write, decrypt on read, for the supported handler
//! revisions.

mod common;

use common::{one_page_pdf, page_content};
use pdfmill::crypt::EncryptionParams;
use pdfmill::writer::WriteOptions;
use pdfmill::{File, PdfError, Writer};

fn encrypted(params: EncryptionParams) -> Vec<u8> {
    let mut file = File::from_data(one_page_pdf()).unwrap();
    let options = WriteOptions { encrypt: Some(params), ..WriteOptions::default() };
    Writer::new(&mut file, options).write_to_vec().unwrap()
}

#[test]
fn aes256_owner_and_user_passwords() {
    let out = encrypted(EncryptionParams::aes256(b"user", b"owner", -4));
    assert!(String::from_utf8_lossy(&out).contains("/AESV3"));

    let with_owner = File::from_data_password(out.clone(), b"owner").unwrap();
    let catalog = with_owner.catalog().unwrap();
    assert_eq!(catalog.get("Type").unwrap().as_name().unwrap(), "Catalog");
    assert_eq!(page_content(&with_owner, 0), b"BT ET\n");

    let with_user = File::from_data_password(out.clone(), b"user").unwrap();
    assert_eq!(page_content(&with_user, 0), b"BT ET\n");

    match File::from_data_password(out, b"wrong") {
        Err(PdfError::InvalidPassword) => {}
        other => panic!("expected InvalidPassword, got {:?}", other.err()),
    }
}

#[test]
fn reencrypt_with_new_password() {
    // open with the owner password, re-encrypt for a different user
    let out = encrypted(EncryptionParams::aes256(b"", b"owner", -4));
    let mut doc = File::from_data_password(out, b"owner").unwrap();

    let options = WriteOptions {
        encrypt: Some(EncryptionParams::aes256(b"user2", b"owner2", -4)),
        ..WriteOptions::default()
    };
    let out = Writer::new(&mut doc, options).write_to_vec().unwrap();

    let reopened = File::from_data_password(out, b"user2").unwrap();
    assert_eq!(page_content(&reopened, 0), b"BT ET\n");
}

#[test]
fn rc4_roundtrip() {
    let out = encrypted(EncryptionParams::rc4_128(b"user", b"owner", -4));
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("/Encrypt"));

    for pass in [&b"user"[..], b"owner"] {
        let doc = File::from_data_password(out.clone(), pass).unwrap();
        assert_eq!(page_content(&doc, 0), b"BT ET\n");
    }
    assert!(File::from_data_password(out, b"nope").is_err());
}

#[test]
fn aes128_roundtrip() {
    let out = encrypted(EncryptionParams::aes128(b"u", b"o", -1));
    assert!(String::from_utf8_lossy(&out).contains("/AESV2"));
    let doc = File::from_data_password(out, b"u").unwrap();
    assert_eq!(page_content(&doc, 0), b"BT ET\n");
}

#[test]
fn preserve_encryption_keeps_both_passwords() {
    let out = encrypted(EncryptionParams::aes256(b"user", b"owner", -4));
    let mut doc = File::from_data_password(out, b"owner").unwrap();

    let options = WriteOptions { preserve_encryption: true, ..WriteOptions::default() };
    let out = Writer::new(&mut doc, options).write_to_vec().unwrap();

    for pass in [&b"user"[..], b"owner"] {
        let reopened = File::from_data_password(out.clone(), pass).unwrap();
        assert_eq!(page_content(&reopened, 0), b"BT ET\n");
    }
}

#[test]
fn strings_are_encrypted_on_disk() {
    let mut file = File::from_data(one_page_pdf()).unwrap();
    // plant a distinctive string in the catalog
    let root = file.trailer().get("Root").unwrap().as_reference().unwrap();
    let mut catalog = file.resolve_ref(root).unwrap().into_dictionary(file.storage()).unwrap();
    catalog.insert("Marker", pdfmill::primitive::Primitive::String(pdfmill::primitive::PdfString::new(*b"very secret words")));
    file.replace(root, pdfmill::primitive::Primitive::Dictionary(catalog)).unwrap();

    let options =
        WriteOptions { encrypt: Some(EncryptionParams::aes256(b"pw", b"pw", -1)), ..WriteOptions::default() };
    let out = Writer::new(&mut file, options).write_to_vec().unwrap();
    assert!(
        !out.windows(b"very secret words".len()).any(|w| w == b"very secret words"),
        "plaintext string leaked into encrypted output"
    );

    let reopened = File::from_data_password(out, b"pw").unwrap();
    let marker = reopened.catalog().unwrap().get("Marker").unwrap().clone();
    assert_eq!(marker.as_string().unwrap().as_bytes(), b"very secret words");
}

#[test]
fn unencrypted_with_password_is_flagged() {
    let file = File::from_data_password(one_page_pdf(), b"whatever").unwrap();
    assert!(file.any_warnings());
    assert!(matches!(file.warnings()[0], PdfError::NotEncrypted));
}

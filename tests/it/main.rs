//! Integration tests exercising pack, unpack, diff, export and apply
//! against real directory trees.

use std::collections::BTreeMap;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::Result;
use tokio::io::AsyncReadExt;

use layertar::{
    apply_layer, changes_dirs, export_changes, is_archive_path, tar, tar_with_options, untar,
    ArchiveError, Change, ChangeKind, ChownOpts, Compression, IdMap, IdentityMapping, TarOptions,
    TarStream, TempArchive,
};

async fn read_stream(mut s: TarStream) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    s.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Pack `origin` with `options`, verify the advertised compression is
/// what the stream actually carries, unpack into a fresh directory and
/// diff the result against the origin.
async fn tar_untar(origin: &Path, options: &TarOptions) -> Result<(tempfile::TempDir, Vec<Change>)> {
    let stream = tar_with_options(origin, options)?;
    let buf = read_stream(stream).await?;
    assert_eq!(Compression::detect(&buf), options.compression);

    let dest = tempfile::tempdir()?;
    untar(std::io::Cursor::new(buf), dest.path(), &TarOptions::default())?;
    let changes = changes_dirs(dest.path(), origin)?;
    Ok((dest, changes))
}

fn write_origin_files(origin: &Path) -> Result<()> {
    std::fs::write(origin.join("1"), "hello world")?;
    std::fs::write(origin.join("2"), "welcome!")?;
    std::fs::write(origin.join("3"), "will be ignored")?;
    Ok(())
}

#[tokio::test]
async fn test_tar_untar_with_exclude() -> Result<()> {
    let origin = tempfile::tempdir()?;
    write_origin_files(origin.path())?;

    for compression in [Compression::None, Compression::Gzip] {
        let opts = TarOptions {
            compression,
            exclude_patterns: vec!["3".into()],
            ..Default::default()
        };
        let (_dest, changes) = tar_untar(origin.path(), &opts).await?;
        assert_eq!(changes.len(), 1, "{compression:?}: {changes:?}");
        assert_eq!(changes[0].path, Path::new("/3"));
        assert_eq!(changes[0].kind, ChangeKind::Delete);
    }
    Ok(())
}

#[tokio::test]
async fn test_tar_untar_include_and_rebase() -> Result<()> {
    let origin = tempfile::tempdir()?;
    write_origin_files(origin.path())?;

    let opts = TarOptions {
        include_files: vec!["1".into()],
        rebase_names: BTreeMap::from([("1".to_string(), "test".to_string())]),
        ..Default::default()
    };
    let (dest, changes) = tar_untar(origin.path(), &opts).await?;
    // Files 1, 2 and 3 are absent from the archive; only "test" (the
    // rebased copy of 1) comes back.
    assert!(dest.path().join("test").exists());
    assert!(!dest.path().join("1").exists());
    assert_eq!(changes.len(), 4, "{changes:?}");
    Ok(())
}

#[tokio::test]
async fn test_include_exclude_cases() -> Result<()> {
    // A directory plus two files, filtered in various ways.
    let origin = tempfile::tempdir()?;
    std::fs::create_dir(origin.path().join("folder"))?;
    std::fs::write(origin.path().join("1"), "hello world")?;
    std::fs::write(origin.path().join("2"), "welcome!")?;

    let cases: &[(TarOptions, usize)] = &[
        (
            TarOptions {
                include_files: vec!["1".into()],
                ..Default::default()
            },
            2,
        ),
        (
            TarOptions {
                exclude_patterns: vec!["2".into()],
                ..Default::default()
            },
            1,
        ),
        (
            TarOptions {
                exclude_patterns: vec!["1".into(), "folder*".into()],
                ..Default::default()
            },
            2,
        ),
        (
            TarOptions {
                include_files: vec!["1".into(), "1".into()],
                ..Default::default()
            },
            2,
        ),
    ];
    for (opts, expected) in cases {
        let (_dest, changes) = tar_untar(origin.path(), opts).await?;
        assert_eq!(changes.len(), *expected, "{opts:?}: {changes:?}");
    }
    Ok(())
}

#[tokio::test]
async fn test_chown_opts_always_override_id_map() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let file_path = dir.path().join("1");
    std::fs::write(&file_path, "hello world")?;

    let id_maps = vec![
        IdMap {
            container_id: 0,
            host_id: 0,
            size: 65536,
        },
        IdMap {
            container_id: 0,
            host_id: 100000,
            size: 65536,
        },
    ];
    let cases = [
        (
            TarOptions {
                chown_opts: Some(ChownOpts { uid: 1337, gid: 42 }),
                ..Default::default()
            },
            (1337, 42),
        ),
        (
            TarOptions {
                chown_opts: Some(ChownOpts {
                    uid: 100001,
                    gid: 100001,
                }),
                id_map: IdentityMapping {
                    uid_maps: id_maps.clone(),
                    gid_maps: id_maps.clone(),
                },
                ..Default::default()
            },
            (100001, 100001),
        ),
        (
            TarOptions {
                chown_opts: Some(ChownOpts { uid: 0, gid: 0 }),
                ..Default::default()
            },
            (0, 0),
        ),
        (
            TarOptions {
                chown_opts: Some(ChownOpts { uid: 1, gid: 1 }),
                no_lchown: true,
                ..Default::default()
            },
            (1, 1),
        ),
    ];
    for (opts, (uid, gid)) in cases {
        let buf = read_stream(tar_with_options(&file_path, &opts)?).await?;
        let mut archive = tar::Archive::new(&buf[..]);
        let mut seen = 0;
        for entry in archive.entries()? {
            let entry = entry?;
            assert_eq!(entry.header().uid()?, uid, "{opts:?}");
            assert_eq!(entry.header().gid()?, gid, "{opts:?}");
            seen += 1;
        }
        assert!(seen > 0);
    }
    Ok(())
}

#[tokio::test]
async fn test_many_files_no_changes() -> Result<()> {
    for hardlinks in [false, true] {
        let origin = tempfile::tempdir()?;
        for n in 0..200 {
            let p = origin.path().join(format!("file-{n}"));
            std::fs::write(&p, "fooo")?;
            if hardlinks {
                std::fs::hard_link(&p, origin.path().join(format!("file-{n}-link")))?;
            }
        }
        let (_dest, changes) = tar_untar(origin.path(), &TarOptions::default()).await?;
        assert_eq!(changes, vec![], "hardlinks={hardlinks}");
    }
    Ok(())
}

#[tokio::test]
async fn test_hardlinks_survive_roundtrip() -> Result<()> {
    let origin = tempfile::tempdir()?;
    std::fs::write(origin.path().join("1"), "hello world")?;
    std::fs::hard_link(origin.path().join("1"), origin.path().join("2"))?;

    let buf = read_stream(tar(origin.path(), Compression::None)?).await?;
    let dest = tempfile::tempdir()?;
    untar(std::io::Cursor::new(buf), dest.path(), &TarOptions::default())?;

    let i1 = std::fs::metadata(dest.path().join("1"))?.ino();
    let i2 = std::fs::metadata(dest.path().join("2"))?.ino();
    assert_eq!(i1, i2);
    Ok(())
}

fn headers_of(buf: &[u8]) -> Result<Vec<(String, u64, u8, String)>> {
    let mut ret = Vec::new();
    let mut archive = tar::Archive::new(buf);
    for entry in archive.entries()? {
        let entry = entry?;
        ret.push((
            entry.path()?.to_string_lossy().into_owned(),
            entry.header().size()?,
            entry.header().entry_type().as_byte(),
            entry
                .link_name()?
                .map(|l| l.to_string_lossy().into_owned())
                .unwrap_or_default(),
        ));
    }
    Ok(ret)
}

#[tokio::test]
async fn test_hardlink_export_order_stability() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    for name in ["file1.txt", "file2.txt", "file3.txt"] {
        std::fs::write(src.path().join(name), "Hey y'all")?;
        std::fs::write(dest.path().join(name), "Hey y'all")?;
        for i in 0..5 {
            std::fs::hard_link(
                dest.path().join(name),
                dest.path().join(format!("{name}.link{i}")),
            )?;
        }
    }

    let mut changes = changes_dirs(dest.path(), src.path())?;
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    let ascending = read_stream(export_changes(
        dest.path(),
        changes.clone(),
        &IdentityMapping::default(),
    )?)
    .await?;

    changes.reverse();
    let descending = read_stream(export_changes(
        dest.path(),
        changes,
        &IdentityMapping::default(),
    )?)
    .await?;

    let mut h1 = headers_of(&ascending)?;
    let mut h2 = headers_of(&descending)?;
    h1.sort();
    h2.sort();
    assert!(!h1.is_empty());
    assert_eq!(h1, h2);
    Ok(())
}

#[tokio::test]
async fn test_export_apply_matches_direct_edit() -> Result<()> {
    // Start from a common base, edit one copy, export the diff and apply
    // it to another copy of the base.
    let base = tempfile::tempdir()?;
    std::fs::write(base.path().join("keep"), "keep")?;
    std::fs::write(base.path().join("gone"), "gone")?;
    std::fs::create_dir(base.path().join("sub"))?;
    std::fs::write(base.path().join("sub/inner"), "old")?;

    let replica = tempfile::tempdir()?;
    let buf = read_stream(tar(base.path(), Compression::None)?).await?;
    untar(
        std::io::Cursor::new(buf),
        replica.path(),
        &TarOptions::default(),
    )?;

    // Edit the original
    std::fs::remove_file(base.path().join("gone"))?;
    std::fs::write(base.path().join("sub/inner"), "newer contents")?;
    std::fs::write(base.path().join("fresh"), "fresh")?;

    let changes = changes_dirs(base.path(), replica.path())?;
    let layer = read_stream(export_changes(
        base.path(),
        changes,
        &IdentityMapping::default(),
    )?)
    .await?;
    apply_layer(
        replica.path(),
        std::io::Cursor::new(layer),
        &TarOptions::default(),
    )?;

    assert_eq!(changes_dirs(base.path(), replica.path())?, vec![]);
    assert!(!replica.path().join("gone").exists());
    assert_eq!(
        std::fs::read_to_string(replica.path().join("sub/inner"))?,
        "newer contents"
    );
    Ok(())
}

#[tokio::test]
async fn test_all_compression_codecs_roundtrip() -> Result<()> {
    let origin = tempfile::tempdir()?;
    write_origin_files(origin.path())?;
    for compression in [
        Compression::Gzip,
        Compression::Bzip2,
        Compression::Xz,
        Compression::Zstd,
    ] {
        let buf = read_stream(tar(origin.path(), compression)?).await?;
        assert_eq!(Compression::detect(&buf), compression);
        let dest = tempfile::tempdir()?;
        untar(std::io::Cursor::new(buf), dest.path(), &TarOptions::default())?;
        assert_eq!(
            changes_dirs(dest.path(), origin.path())?,
            vec![],
            "{compression:?}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_is_archive_path() -> Result<()> {
    let td = tempfile::tempdir()?;
    let origin = td.path().join("origin");
    std::fs::create_dir(&origin)?;
    std::fs::write(origin.join("f"), "data")?;

    let plain = td.path().join("plain.tar");
    let buf = read_stream(tar(&origin, Compression::None)?).await?;
    std::fs::write(&plain, buf)?;
    assert!(is_archive_path(&plain));

    let gz = td.path().join("c.tar.gz");
    let buf = read_stream(tar(&origin, Compression::Gzip)?).await?;
    std::fs::write(&gz, buf)?;
    assert!(is_archive_path(&gz));

    let not = td.path().join("not.tar");
    std::fs::write(&not, "just some text")?;
    assert!(!is_archive_path(&not));
    assert!(!is_archive_path(td.path()));
    assert!(!is_archive_path(td.path().join("missing")));
    Ok(())
}

#[tokio::test]
async fn test_breakout_leaves_victim_untouched() -> Result<()> {
    let td = tempfile::tempdir()?;
    let dest = td.path().join("dest");
    std::fs::create_dir(&dest)?;
    let victim = td.path().join("victim");
    std::fs::create_dir(&victim)?;
    std::fs::write(victim.join("hello"), "unchanged")?;

    for name in ["../victim/dotdot", "/../victim/slash-dotdot"] {
        // The tar writer refuses `..` in names, so forge the header bytes
        // the way a hostile archive would.
        let mut h = tar::Header::new_gnu();
        h.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name.as_bytes());
        h.set_entry_type(tar::EntryType::Regular);
        h.set_mode(0o644);
        h.set_size(0);
        h.set_cksum();
        let mut b = tar::Builder::new(Vec::new());
        b.append(&h, std::io::empty())?;
        let buf = b.into_inner()?;

        let err = untar(std::io::Cursor::new(buf), &dest, &TarOptions::default()).unwrap_err();
        assert!(
            matches!(
                err.downcast_ref::<ArchiveError>(),
                Some(ArchiveError::Breakout { .. })
            ),
            "{name}: {err:?}"
        );
    }
    // The sibling directory is exactly as before
    assert_eq!(std::fs::read_to_string(victim.join("hello"))?, "unchanged");
    assert_eq!(std::fs::read_dir(&victim)?.count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_xattr_roundtrip_via_pax() -> Result<()> {
    let origin = tempfile::tempdir()?;
    std::fs::write(origin.path().join("plain"), "no attrs")?;
    std::fs::write(origin.path().join("attred"), "has attrs")?;
    // Not every filesystem supports user xattrs; skip quietly if so.
    if rustix::fs::lsetxattr(
        origin.path().join("attred"),
        "user.demo",
        b"payload",
        rustix::fs::XattrFlags::empty(),
    )
    .is_err()
    {
        eprintln!("skipping: no xattr support in the test directory");
        return Ok(());
    }

    let buf = read_stream(tar(origin.path(), Compression::None)?).await?;

    // The attribute is visible in the stream as a PAX record
    let mut archive = tar::Archive::new(&buf[..]);
    let mut seen_record = false;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        if let Some(records) = entry.pax_extensions()? {
            for r in records {
                let r = r?;
                if r.key()? == "SCHILY.xattr.user.demo" {
                    assert_eq!(name, "attred");
                    assert_eq!(r.value_bytes(), b"payload");
                    seen_record = true;
                }
            }
        }
    }
    assert!(seen_record);

    // ... and it survives materialization
    let dest = tempfile::tempdir()?;
    untar(std::io::Cursor::new(buf), dest.path(), &TarOptions::default())?;
    let mut out = [0u8; 64];
    let n = rustix::fs::lgetxattr(dest.path().join("attred"), "user.demo", &mut out)?;
    assert_eq!(&out[..n], b"payload");
    Ok(())
}

#[tokio::test]
async fn test_dropping_stream_cancels_packing() -> Result<()> {
    let origin = tempfile::tempdir()?;
    for n in 0..64 {
        std::fs::write(origin.path().join(format!("f{n}")), vec![0u8; 32 * 1024])?;
    }
    let mut stream = tar(origin.path(), Compression::None)?;
    let mut first = [0u8; 512];
    stream.read_exact(&mut first).await?;
    // Header of the first entry is well-formed tar
    assert_eq!(&first[257..262], b"ustar");
    drop(stream);
    // The walker task notices the closed channel and stops; nothing to
    // observe beyond not hanging or panicking here.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    Ok(())
}

#[tokio::test]
async fn test_untar_with_root_confinement() -> Result<()> {
    let root = tempfile::tempdir()?;
    let dest = root.path().join("inner/dest");
    std::fs::create_dir_all(&dest)?;

    let mut b = tar::Builder::new(Vec::new());
    let mut h = tar::Header::new_gnu();
    h.set_entry_type(tar::EntryType::Regular);
    h.set_mode(0o644);
    h.set_size(2);
    b.append_data(&mut h, "f", &b"ok"[..])?;
    let buf = b.into_inner()?;

    layertar::untar_with_root(
        std::io::Cursor::new(buf),
        &dest,
        root.path(),
        &TarOptions::default(),
    )?;
    assert_eq!(std::fs::read_to_string(dest.join("f"))?, "ok");
    Ok(())
}

#[tokio::test]
async fn test_temp_archive_from_stream() -> Result<()> {
    let origin = tempfile::tempdir()?;
    write_origin_files(origin.path())?;
    let buf = read_stream(tar(origin.path(), Compression::None)?).await?;
    let len = buf.len() as u64;

    let mut spooled = TempArchive::new(std::io::Cursor::new(buf), None)?;
    assert_eq!(spooled.size(), len);
    let dest = tempfile::tempdir()?;
    // TempArchive replays the exact stream
    let mut replay = Vec::new();
    spooled.read_to_end(&mut replay)?;
    untar(
        std::io::Cursor::new(replay),
        dest.path(),
        &TarOptions::default(),
    )?;
    spooled.close()?;
    spooled.close()?;
    assert!(dest.path().join("1").exists());
    Ok(())
}

#[tokio::test]
async fn test_packing_missing_source_fails() {
    let err = tar(Path::new("/nonexistent/source/path"), Compression::None).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ArchiveError>(),
        Some(ArchiveError::InvalidSource { .. })
    ));
}

#[tokio::test]
async fn test_packing_single_file() -> Result<()> {
    let td = tempfile::tempdir()?;
    let f = td.path().join("solo.txt");
    std::fs::write(&f, "by itself")?;
    let buf = read_stream(tar(&f, Compression::None)?).await?;
    let dest = tempfile::tempdir()?;
    untar(std::io::Cursor::new(buf), dest.path(), &TarOptions::default())?;
    assert_eq!(std::fs::read_to_string(dest.path().join("solo.txt"))?, "by itself");
    Ok(())
}

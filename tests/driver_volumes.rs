// tests/driver_volumes.rs
//
// ShareDriver end to end with fake mounts, capacity, image tool and catalog.

mod common;

use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use common::{
    flatten, read_image, unique_root, FakeCatalog, FakeImage, FakeImageTool, FakeMounts,
    StaticProbe,
};
use ShareVol::catalog::ImageMeta;
use ShareVol::shares::GIB;
use ShareVol::{
    DriverConfig, DriverError, ImageTool, ShareDriver, Snapshot, SnapshotStatus, Volume, VolumeFormat,
    VolumeStatus,
};

struct Env {
    root: PathBuf,
    tool: Arc<FakeImageTool>,
    mounts: Arc<FakeMounts>,
    probe: Arc<StaticProbe>,
    driver: ShareDriver,
}

impl Env {
    fn new(prefix: &str) -> Result<Self> {
        Self::with_config(prefix, |c| c)
    }

    fn with_config(prefix: &str, tweak: impl FnOnce(DriverConfig) -> DriverConfig) -> Result<Self> {
        let root = unique_root(prefix);
        fs::write(
            root.join("shares"),
            "# test shares\n//h/a\n//h/b -o user=DOM\\u,password=p\n",
        )?;
        let cfg = tweak(
            DriverConfig::default()
                .with_shares_config(root.join("shares"))
                .with_mount_point_base(root.join("mnt"))
                .with_image_cache_dir(root.join("cache")),
        );

        let tool = FakeImageTool::new();
        let mounts = FakeMounts::new(&root.join("mnt"));
        let probe = StaticProbe::new();
        probe.set("//h/a", 100, 90, 5);
        probe.set("//h/b", 100, 90, 1);

        let driver = ShareDriver::new(cfg, tool.clone(), mounts.clone(), probe.clone());
        Ok(Self {
            root,
            tool,
            mounts,
            probe,
            driver,
        })
    }

    fn dir_b(&self) -> PathBuf {
        self.root.join("mnt/h_b")
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn kind(err: &anyhow::Error) -> DriverError {
    DriverError::kind_of(err).cloned().expect("typed driver error")
}

fn qcow2_volume(env: &Env, id: &str) -> Result<Volume> {
    let mut v = Volume::new(id, &format!("volume-{}", id), 1).with_format(VolumeFormat::Qcow2);
    env.driver.create_volume(&mut v)?;
    Ok(v)
}

#[test]
fn setup_mounts_every_share_and_skips_failures() -> Result<()> {
    let env = Env::new("setup")?;
    env.mounts.fail_share("//h/a");
    env.driver.do_setup()?;

    assert_eq!(env.driver.shares().len(), 2);
    assert_eq!(env.driver.mounted_shares(), vec!["//h/b".to_string()]);
    let mounted = env.mounts.mounted.lock().unwrap().clone();
    assert_eq!(
        mounted,
        vec![(
            "//h/b".to_string(),
            Some("-o user=DOM\\u,password=p".to_string())
        )]
    );
    Ok(())
}

#[test]
fn setup_without_shares_file_is_config_error() -> Result<()> {
    let env = Env::with_config("noshares", |c| c.with_shares_config("/nonexistent/shares"))?;
    let err = env.driver.do_setup().unwrap_err();
    assert!(matches!(kind(&err), DriverError::InvalidConfig(_)));

    let env = Env::with_config("badratio", |c| c.with_used_ratio(1.5))?;
    let err = env.driver.do_setup().unwrap_err();
    assert!(matches!(kind(&err), DriverError::InvalidConfig(_)));
    Ok(())
}

#[test]
fn create_places_on_least_allocated_share() -> Result<()> {
    let env = Env::new("create")?;
    env.driver.do_setup()?;

    let mut v = Volume::new("1", "volume-1", 1);
    assert_eq!(env.driver.create_volume(&mut v)?, "//h/b");
    assert_eq!(v.provider_location.as_deref(), Some("//h/b"));

    // raw default, sparse
    let path = env.dir_b().join("volume-1");
    assert_eq!(fs::metadata(&path)?.len(), GIB);
    assert_eq!(env.tool.count("create"), 0);

    let mut again = Volume::new("1", "volume-1", 1);
    let err = env.driver.create_volume(&mut again).unwrap_err();
    assert!(matches!(kind(&err), DriverError::InvalidVolumeState(_)));

    let mut vhd = Volume::new("2", "volume-2", 2).with_format(VolumeFormat::Vhd);
    env.driver.create_volume(&mut vhd)?;
    let img = read_image(&env.dir_b().join("volume-2.vhd"))?;
    assert_eq!(img.format, "vpc");
    assert_eq!(img.virtual_size, 2 * GIB);
    Ok(())
}

#[test]
fn create_with_no_room_anywhere() -> Result<()> {
    let env = Env::new("noroom")?;
    env.driver.do_setup()?;
    let mut v = Volume::new("1", "volume-1", 500);
    let err = env.driver.create_volume(&mut v).unwrap_err();
    assert_eq!(kind(&err), DriverError::NoEligibleShare { size_gib: 500 });
    assert!(v.provider_location.is_none());

    env.mounts.fail_share("//h/a");
    env.mounts.fail_share("//h/b");
    let mut v = Volume::new("2", "volume-2", 1);
    let err = env.driver.create_volume(&mut v).unwrap_err();
    assert_eq!(kind(&err), DriverError::NoSharesAvailable);
    Ok(())
}

#[test]
fn vhdx_needs_a_recent_image_tool() -> Result<()> {
    let env = Env::new("vhdx")?;
    env.driver.do_setup()?;
    *env.tool.version.lock().unwrap() = Some(vec![1, 6, 9]);

    let mut v = Volume::new("1", "volume-1", 1).with_format(VolumeFormat::Vhdx);
    let err = env.driver.create_volume(&mut v).unwrap_err();
    assert!(matches!(kind(&err), DriverError::UnsupportedFormat(_)));
    assert!(!env.dir_b().join("volume-1.vhdx").exists());

    *env.tool.version.lock().unwrap() = Some(vec![2, 0]);
    let mut v = Volume::new("1", "volume-1", 1).with_format(VolumeFormat::Vhdx);
    env.driver.create_volume(&mut v)?;
    assert!(env.dir_b().join("volume-1.vhdx").exists());
    Ok(())
}

#[test]
fn snapshots_through_the_driver_and_connection_info() -> Result<()> {
    let env = Env::new("snap")?;
    env.driver.do_setup()?;
    let v = qcow2_volume(&env, "1")?;

    let s1 = Snapshot::new("S1", &v);
    assert_eq!(env.driver.create_snapshot(&s1)?, "volume-1-snapshotS1");
    assert_eq!(env.driver.active_image(&v)?, "volume-1-snapshotS1");

    let conn = env.driver.initialize_connection(&v)?;
    assert_eq!(conn.driver_volume_type, "smbfs");
    assert_eq!(conn.data.export, "//h/b");
    assert_eq!(conn.data.name, "volume-1-snapshotS1");
    assert_eq!(conn.data.options.as_deref(), Some("-o user=DOM\\u,password=p"));
    assert_eq!(conn.mount_point_base, env.root.join("mnt"));

    let chain = env.driver.backing_chain(&v)?;
    let names: Vec<&str> = chain.iter().map(|n| n.filename.as_str()).collect();
    assert_eq!(names, vec!["volume-1-snapshotS1", "volume-1"]);

    env.driver.delete_snapshot(&s1)?;
    assert_eq!(env.driver.active_image(&v)?, "volume-1");
    assert_eq!(env.driver.initialize_connection(&v)?.data.name, "volume-1");
    Ok(())
}

#[test]
fn concurrent_snapshot_creates_serialize() -> Result<()> {
    let env = Env::new("concurrent")?;
    env.driver.do_setup()?;
    let v = qcow2_volume(&env, "1")?;

    std::thread::scope(|s| {
        for t in 0..4 {
            let driver = &env.driver;
            let v = v.clone();
            s.spawn(move || {
                driver
                    .create_snapshot(&Snapshot::new(&format!("t{}", t), &v))
                    .unwrap();
            });
        }
    });

    let chain = env.driver.backing_chain(&v)?;
    assert_eq!(chain.len(), 5);
    let rec = ShareVol::read_info(&env.driver.info_path(&v)?, false)?;
    assert_eq!(rec.snapshot_count(), 4);
    assert_eq!(rec.active(), Some(chain[0].filename.as_str()));
    Ok(())
}

#[test]
fn extend_rules() -> Result<()> {
    let env = Env::new("extend")?;
    env.driver.do_setup()?;
    let v = qcow2_volume(&env, "1")?;

    env.driver.extend_volume(&v, 3)?;
    assert_eq!(read_image(&env.dir_b().join("volume-1"))?.virtual_size, 3 * GIB);
    let v = Volume { size_gib: 3, ..v };

    let err = env.driver.extend_volume(&v, 2).unwrap_err();
    assert!(matches!(kind(&err), DriverError::InvalidVolumeState(_)));

    let err = env.driver.extend_volume(&v, 200).unwrap_err();
    assert_eq!(kind(&err), DriverError::NoEligibleShare { size_gib: 197 });

    env.driver.create_snapshot(&Snapshot::new("S1", &v))?;
    let err = env.driver.extend_volume(&v, 4).unwrap_err();
    assert!(matches!(kind(&err), DriverError::InvalidVolumeState(_)));
    Ok(())
}

#[test]
fn failed_resize_leaves_the_volume_as_is() -> Result<()> {
    let env = Env::new("extend-lie")?;
    env.driver.do_setup()?;
    let v = qcow2_volume(&env, "1")?;

    env.tool.fail("resize");
    let err = env.driver.extend_volume(&v, 2).unwrap_err();
    assert!(matches!(kind(&err), DriverError::BackendCommandFailed(_)));
    assert_eq!(read_image(&env.dir_b().join("volume-1"))?.virtual_size, GIB);
    Ok(())
}

#[test]
fn clone_copies_current_content_and_drops_the_temp_snapshot() -> Result<()> {
    let env = Env::new("clone")?;
    env.driver.do_setup()?;
    let src = qcow2_volume(&env, "1")?;
    env.tool.guest_write(&env.dir_b().join("volume-1"), "a")?;
    env.driver.create_snapshot(&Snapshot::new("S1", &src))?;
    env.tool.guest_write(&env.dir_b().join("volume-1-snapshotS1"), "b")?;

    // placement of the clone follows the source, not the capacity probe
    env.probe.set("//h/a", 100, 90, 0);
    let mut dst = Volume::new("2", "volume-2", 1).with_format(VolumeFormat::Qcow2);
    assert_eq!(env.driver.create_cloned_volume(&mut dst, &src)?, "//h/b");

    let out = read_image(&env.dir_b().join("volume-2"))?;
    assert_eq!(out.format, "qcow2");
    assert_eq!(out.backing_file, None);
    assert_eq!(out.data, vec!["a", "b"]);

    let rec = ShareVol::read_info(&env.driver.info_path(&src)?, false)?;
    assert_eq!(rec.snapshot_count(), 1);
    assert_eq!(rec.active(), Some("volume-1-snapshotS1"));
    assert!(!env.dir_b().join("volume-1-snapshottmp-snap-1").exists());

    let mut again = Volume::new("2", "volume-2", 1).with_format(VolumeFormat::Qcow2);
    let err = env.driver.create_cloned_volume(&mut again, &src).unwrap_err();
    assert!(matches!(kind(&err), DriverError::InvalidVolumeState(_)));

    let busy = src.clone().with_status(VolumeStatus::InUse);
    let mut other = Volume::new("3", "volume-3", 1);
    let err = env.driver.create_cloned_volume(&mut other, &busy).unwrap_err();
    assert!(matches!(kind(&err), DriverError::InvalidVolumeState(_)));
    Ok(())
}

#[test]
fn failed_clone_copy_still_removes_the_temp_snapshot() -> Result<()> {
    let env = Env::new("clone-fail")?;
    env.driver.do_setup()?;
    let src = qcow2_volume(&env, "1")?;

    env.tool.fail("convert");
    let mut dst = Volume::new("2", "volume-2", 1);
    let err = env.driver.create_cloned_volume(&mut dst, &src).unwrap_err();
    assert!(matches!(kind(&err), DriverError::BackendCommandFailed(_)));

    let rec = ShareVol::read_info(&env.driver.info_path(&src)?, true)?;
    assert_eq!(rec.snapshot_count(), 0);
    assert_eq!(env.driver.active_image(&src)?, "volume-1");
    assert!(!env.dir_b().join("volume-1-snapshottmp-snap-1").exists());
    Ok(())
}

#[test]
fn volume_from_snapshot_has_point_in_time_content() -> Result<()> {
    let env = Env::new("fromsnap")?;
    env.driver.do_setup()?;
    let src = qcow2_volume(&env, "1")?;
    env.tool.guest_write(&env.dir_b().join("volume-1"), "before")?;
    let snap = Snapshot::new("S1", &src);
    env.driver.create_snapshot(&snap)?;
    env.tool.guest_write(&env.dir_b().join("volume-1-snapshotS1"), "after")?;

    let mut dst = Volume::new("2", "volume-2", 1).with_format(VolumeFormat::Qcow2);
    env.driver.create_volume_from_snapshot(&mut dst, &snap)?;
    assert_eq!(flatten(&env.dir_b().join("volume-2"))?, vec!["before"]);

    let mut creating = snap.clone();
    creating.status = SnapshotStatus::Creating;
    let mut dst3 = Volume::new("3", "volume-3", 1);
    let err = env
        .driver
        .create_volume_from_snapshot(&mut dst3, &creating)
        .unwrap_err();
    assert!(matches!(kind(&err), DriverError::InvalidSnapshotState(_)));
    assert!(dst3.provider_location.is_none());
    Ok(())
}

#[test]
fn upload_flattens_volumes_with_snapshots() -> Result<()> {
    let env = Env::new("upload")?;
    env.driver.do_setup()?;
    let v = qcow2_volume(&env, "1")?;
    let cat = FakeCatalog::new();

    env.tool.guest_write(&env.dir_b().join("volume-1"), "a")?;
    env.driver.copy_volume_to_image(&v, &cat, &ImageMeta::new("img-plain"))?;
    assert_eq!(env.tool.count("convert"), 0);

    env.driver.create_snapshot(&Snapshot::new("S1", &v))?;
    env.tool.guest_write(&env.dir_b().join("volume-1-snapshotS1"), "b")?;
    env.driver.copy_volume_to_image(&v, &cat, &ImageMeta::new("img-flat"))?;
    assert_eq!(env.tool.count("convert"), 1);
    assert!(!env.dir_b().join("1.temp_image.img-flat").exists());

    let uploads = cat.uploads.lock().unwrap().clone();
    assert_eq!(
        uploads,
        vec![
            ("img-plain".to_string(), "qcow2".to_string(), vec!["a".to_string()]),
            (
                "img-flat".to_string(),
                "qcow2".to_string(),
                vec!["a".to_string(), "b".to_string()]
            ),
        ]
    );
    Ok(())
}

#[test]
fn image_to_volume_and_size_check() -> Result<()> {
    let env = Env::new("img2vol")?;
    env.driver.do_setup()?;
    let cat = FakeCatalog::new();
    let mut img = FakeImage::new("qcow2", GIB);
    img.data.push("os".into());
    cat.add("img", img, Some("qcow2"));

    let v = Volume::new("1", "volume-1", 2)
        .with_format(VolumeFormat::Qcow2)
        .with_location("//h/b");
    env.driver.copy_image_to_volume(&v, &cat, "img")?;
    let out = read_image(&env.dir_b().join("volume-1"))?;
    assert_eq!(out.virtual_size, 2 * GIB);
    assert_eq!(out.data, vec!["os"]);

    // an image larger than the volume
    let mut big = FakeImage::new("qcow2", 4 * GIB);
    big.data.push("big".into());
    cat.add("big", big, Some("qcow2"));
    let v2 = Volume::new("2", "volume-2", 2)
        .with_format(VolumeFormat::Qcow2)
        .with_location("//h/b");
    let err = env.driver.copy_image_to_volume(&v2, &cat, "big").unwrap_err();
    assert!(matches!(kind(&err), DriverError::SizeMismatch(_)));

    *env.tool.version.lock().unwrap() = Some(vec![1, 2]);
    let v3 = Volume::new("3", "volume-3", 1)
        .with_format(VolumeFormat::Vhdx)
        .with_location("//h/b");
    let err = env.driver.copy_image_to_volume(&v3, &cat, "img").unwrap_err();
    assert!(matches!(kind(&err), DriverError::UnsupportedFormat(_)));
    Ok(())
}

#[test]
fn image_overwrites_a_freshly_created_volume() -> Result<()> {
    let env = Env::new("img-over")?;
    env.driver.do_setup()?;
    let cat = FakeCatalog::new();
    let mut img = FakeImage::new("qcow2", GIB);
    img.data.push("os".into());
    cat.add("img", img, Some("qcow2"));

    let v = qcow2_volume(&env, "1")?;
    assert!(env.dir_b().join("volume-1").exists());
    env.driver.copy_image_to_volume(&v, &cat, "img")?;

    assert_eq!(cat.fetches.load(std::sync::atomic::Ordering::Relaxed), 1);
    let out = read_image(&env.dir_b().join("volume-1"))?;
    assert_eq!(out.data, vec!["os"]);
    assert_eq!(out.virtual_size, GIB);
    // only the volume and its lock remain, no temp files
    let names: Vec<String> = fs::read_dir(env.dir_b())?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with('.'))
        .collect();
    assert!(names.is_empty(), "leftovers: {:?}", names);
    Ok(())
}

#[test]
fn image_cache_is_shared_between_volumes() -> Result<()> {
    let env = Env::with_config("cached", |c| c.with_cache_fetched_images(true))?;
    env.driver.do_setup()?;
    let cat = FakeCatalog::new();
    cat.add("img", FakeImage::new("raw", GIB), Some("raw"));

    for id in ["1", "2"] {
        let v = Volume::new(id, &format!("volume-{}", id), 1)
            .with_format(VolumeFormat::Qcow2)
            .with_location("//h/b");
        env.driver.copy_image_to_volume(&v, &cat, "img")?;
    }
    assert_eq!(cat.fetches.load(std::sync::atomic::Ordering::Relaxed), 1);
    assert!(env.root.join("cache/img.qcow2").exists());
    Ok(())
}

#[test]
fn delete_volume_removes_the_whole_chain() -> Result<()> {
    let env = Env::new("delete")?;
    env.driver.do_setup()?;
    let v = qcow2_volume(&env, "1")?;
    env.driver.create_snapshot(&Snapshot::new("S1", &v))?;
    env.driver.create_snapshot(&Snapshot::new("S2", &v))?;

    env.driver.delete_volume(&v)?;
    let mut left: Vec<String> = fs::read_dir(env.dir_b())?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    left.sort();
    assert!(left.is_empty(), "left behind: {:?}", left);

    // unplaced volumes are a no-op
    env.driver.delete_volume(&Volume::new("9", "volume-9", 1))?;
    // deleting twice is fine
    env.driver.delete_volume(&v)?;
    Ok(())
}

#[test]
fn reconcile_through_the_driver() -> Result<()> {
    let env = Env::new("reconcile")?;
    env.driver.do_setup()?;
    let v = qcow2_volume(&env, "1")?;
    env.driver.create_snapshot(&Snapshot::new("S1", &v))?;

    env.tool.commit(&env.dir_b().join("volume-1-snapshotS1"))?;

    let rep = env.driver.reconcile_active(&v, false)?;
    assert!(rep.changed);
    assert_eq!(rep.active, "volume-1");
    assert_eq!(rep.dangling, vec!["S1".to_string()]);
    assert_eq!(env.driver.active_image(&v)?, "volume-1");
    Ok(())
}

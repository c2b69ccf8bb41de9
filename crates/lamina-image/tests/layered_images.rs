//! End-to-end tests of layered images against in-process host fakes.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use lamina_common::{ErrorKind, LaminaError, LaminaPaths};
use lamina_host::Host;
use lamina_host::mount::MountUnitNames;
use lamina_host::testing::{FakeMachineRegistry, FakeUnitManager};
use lamina_image::{AnyImage, Caveat, Image, ImageCtl, LayeredImage};
use walkdir::WalkDir;

struct World {
    _temp: tempfile::TempDir,
    paths: LaminaPaths,
    units: Arc<FakeUnitManager>,
    machines: Arc<FakeMachineRegistry>,
    ctl: ImageCtl,
}

fn world() -> World {
    let temp = tempfile::tempdir().unwrap();
    let paths = LaminaPaths::with_root(temp.path());
    paths.create_dirs().unwrap();

    let units = Arc::new(FakeUnitManager::new(paths.units.clone()));
    let machines = Arc::new(FakeMachineRegistry::new(paths.machines.clone()));
    let host = Host::new(paths.clone(), units.clone(), machines.clone());

    World {
        _temp: temp,
        paths,
        units,
        machines,
        ctl: ImageCtl::new(host),
    }
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn read(root: &Path, rel: &str) -> String {
    fs::read_to_string(root.join(rel)).unwrap()
}

/// Every file below `root` with its content.
fn snapshot(root: &Path) -> BTreeMap<String, String> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|entry| {
            let entry = entry.unwrap();
            let rel = entry.path().strip_prefix(root).unwrap().display().to_string();
            if entry.file_type().is_dir() {
                (format!("{rel}/"), String::new())
            } else {
                (rel, fs::read_to_string(entry.path()).unwrap())
            }
        })
        .collect()
}

/// Create a root image holding `files`, then freeze it.
async fn frozen_image(w: &World, name: &str, base: Option<&str>, files: &[(&str, &str)]) -> LayeredImage {
    let mut image = w.ctl.create_image(name, base).await.unwrap();
    for (rel, content) in files {
        write(&image.layer_fs_root(), rel, content);
    }
    image.set_read_only(true).await.unwrap();
    image
}

#[test_log::test(tokio::test)]
async fn create_mounts_a_writable_root_image() {
    let w = world();
    let image = w.ctl.create_image("base", None).await.unwrap();

    assert_eq!(image.image_type(), "layered");
    assert!(image.ready());
    assert!(!image.read_only());
    assert!(!image.alive());
    assert!(image.path().is_dir());
    assert_eq!(image.path(), w.paths.image_path("base"));
    assert_eq!(read(&image.layer_root(), "id"), "base");
    assert_eq!(read(&image.layer_root(), "frozen"), "n");
    assert!(!image.layer_root().join("base").exists());

    let spec = image.expected_mount();
    assert_eq!(spec.options, "bind");
    let names = MountUnitNames::for_path(image.path());
    assert!(w.units.is_active(&names.mount));
    assert!(w.units.is_enabled(&names.automount));
}

#[test_log::test(tokio::test)]
async fn identical_file_is_served_from_base_after_optimize() {
    let w = world();
    let base = frozen_image(&w, "base", None, &[("etc/x", "v1")]).await;
    assert!(base.read_only());
    assert_eq!(read(base.path(), "etc/x"), "v1");

    let mut child = w.ctl.create_image("child", Some("base")).await.unwrap();
    assert_eq!(child.base_name(), Some("base"));
    write(&child.layer_fs_root(), "etc/x", "v1");

    let mut status = Vec::new();
    let mut errors = Vec::new();
    let report = child.optimize(&mut |s| status.push(s.to_string()), &mut |e| errors.push(e));
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(report.files_removed, 1);
    assert!(status.contains(&"Removed /etc/x".to_string()));
    assert!(!child.layer_fs_root().join("etc/x").exists());
    assert!(base.layer_fs_root().join("etc/x").exists());

    child.set_ready(false).await.unwrap();
    child.set_ready(true).await.unwrap();
    assert_eq!(read(child.path(), "etc/x"), "v1");
}

#[test_log::test(tokio::test)]
async fn writable_base_is_rejected_without_side_effects() {
    let w = world();
    w.ctl.create_image("base", None).await.unwrap();
    w.units.clear_calls();

    let err = w.ctl.create_image("child2", Some("base")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(matches!(err, LaminaError::BaseWritable { .. }));
    assert!(!w.paths.layer_root("child2").exists());
    assert!(!w.paths.image_path("child2").exists());
    assert!(w.units.calls().is_empty());
}

#[test_log::test(tokio::test)]
async fn missing_base_and_existing_name() {
    let w = world();
    let err = w.ctl.create_image("x", Some("nope")).await.unwrap_err();
    assert!(matches!(err, LaminaError::BaseDoesNotExist { ref name } if name == "nope"));
    assert_eq!(err.kind(), ErrorKind::NotFound);

    w.ctl.create_image("base", None).await.unwrap();
    let err = w.ctl.create_image("base", None).await.unwrap_err();
    assert!(matches!(err, LaminaError::ImageExists { .. }));

    w.machines.add_image("flat", true).unwrap();
    let err = w.ctl.create_image("flat", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = w.ctl.create_image("bad/name", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
}

#[test_log::test(tokio::test)]
async fn tags_resolve_transparently() {
    let w = world();
    frozen_image(&w, "base", None, &[]).await;
    w.ctl.create_image("child", Some("base")).await.unwrap();

    w.ctl.tag("stable", "child").await.unwrap();
    let via_tag = w.ctl.get_image("stable").await.unwrap();
    let direct = w.ctl.get_image("child").await.unwrap();
    assert_eq!(via_tag.name(), "child");
    assert_eq!(via_tag.summary(), direct.summary());

    let err = w.ctl.tag("stable", "base").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = w.ctl.tag("child", "base").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(w.ctl.untag("stable").unwrap(), "child");
    let child = w.ctl.get_image("child").await.unwrap();
    assert!(child.ready());
    assert_eq!(w.ctl.get_image("stable").await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(w.ctl.untag("child").unwrap_err().kind(), ErrorKind::NotATag);
}

#[test_log::test(tokio::test)]
async fn alive_images_refuse_mutation() {
    let w = world();
    w.ctl.create_image("web", None).await.unwrap();
    w.machines.start_machine("web");

    let mut image = w.ctl.get_image("web").await.unwrap();
    assert!(image.alive());
    assert!(image.ready());
    w.units.clear_calls();

    assert_eq!(image.set_ready(false).await.unwrap_err().kind(), ErrorKind::Busy);
    assert_eq!(image.set_read_only(true).await.unwrap_err().kind(), ErrorKind::Busy);
    assert_eq!(image.remove().await.unwrap_err().kind(), ErrorKind::Busy);
    let mut errors = Vec::new();
    let report = image.optimize(&mut |_| {}, &mut |e| errors.push(e.kind()));
    assert!(report.is_empty());
    assert_eq!(errors, vec![ErrorKind::Busy]);

    // Guards run before anything is touched.
    assert!(w.units.calls().is_empty());
    assert!(!image.read_only());
    assert!(w.paths.layer_root("web").is_dir());

    // Already ready: nothing to do.
    image.set_ready(true).await.unwrap();

    w.machines.stop_machine("web");
    image.update().await.unwrap();
    image.set_read_only(true).await.unwrap();
    assert!(image.read_only());
}

#[test_log::test(tokio::test)]
async fn same_value_is_a_noop() {
    let w = world();
    let mut image: AnyImage = w.ctl.create_image("web", None).await.unwrap().into();
    w.units.clear_calls();

    image.set_ready(true).await.unwrap();
    image.set_read_only(false).await.unwrap();
    assert!(w.units.calls().is_empty());

    image.set_ready(false).await.unwrap();
    w.units.clear_calls();
    image.set_ready(false).await.unwrap();
    assert!(w.units.calls().is_empty());
}

#[test_log::test(tokio::test)]
async fn ready_round_trip_reproduces_the_view() {
    let w = world();
    frozen_image(&w, "base", None, &[("etc/os", "lamina"), ("usr/bin/sh", "#!")]).await;
    let mut image = w.ctl.create_image("web", Some("base")).await.unwrap();
    write(&image.layer_fs_root(), "srv/index.html", "hi");
    image.set_ready(false).await.unwrap();
    image.set_ready(true).await.unwrap();

    let view = snapshot(image.path());
    let spec = image.expected_mount();
    let orchestrator = w.ctl.host().orchestrator();
    assert_eq!(orchestrator.installed_spec(image.path()).unwrap().as_ref(), Some(&spec));

    image.set_ready(false).await.unwrap();
    assert!(!image.path().exists());
    assert!(orchestrator.installed_spec(image.path()).unwrap().is_none());

    image.set_ready(true).await.unwrap();
    assert_eq!(snapshot(image.path()), view);
    assert_eq!(orchestrator.installed_spec(image.path()).unwrap(), Some(spec));
    assert_eq!(read(image.path(), "srv/index.html"), "hi");
}

#[test_log::test(tokio::test)]
async fn nearest_ancestor_shadows_distant_ones() {
    let w = world();
    let a = frozen_image(&w, "a", None, &[("etc/x", "A"), ("etc/a", "a")]).await;
    let b = frozen_image(&w, "b", Some("a"), &[]).await;
    let c = frozen_image(&w, "c", Some("b"), &[("etc/x", "C")]).await;
    let d = w.ctl.create_image("d", Some("c")).await.unwrap();

    assert_eq!(
        d.base_layers(),
        vec![a.layer_fs_root(), b.layer_fs_root(), c.layer_fs_root()]
    );
    assert_eq!(
        d.expected_mount().lower_dirs(),
        vec![c.layer_fs_root(), b.layer_fs_root(), a.layer_fs_root()]
    );
    assert_eq!(read(d.path(), "etc/x"), "C");
    assert_eq!(read(d.path(), "etc/a"), "a");
}

#[test_log::test(tokio::test)]
async fn optimize_twice_removes_nothing_more() {
    let w = world();
    frozen_image(&w, "base", None, &[("etc/x", "v1"), ("etc/y", "v1")]).await;
    let child = w.ctl.create_image("child", Some("base")).await.unwrap();
    write(&child.layer_fs_root(), "etc/x", "v1");
    write(&child.layer_fs_root(), "etc/y", "v2");

    let first = child.optimize(&mut |_| {}, &mut |e| panic!("{e}"));
    assert_eq!(first.files_removed, 1);
    let second = child.optimize(&mut |_| {}, &mut |e| panic!("{e}"));
    assert!(second.is_empty());
    assert_eq!(read(&child.layer_fs_root(), "etc/y"), "v2");
}

#[test_log::test(tokio::test)]
async fn root_image_optimize_is_a_noop() {
    let w = world();
    let image = w.ctl.create_image("base", None).await.unwrap();
    write(&image.layer_fs_root(), "etc/x", "v1");
    let report = image.optimize(&mut |_| {}, &mut |e| panic!("{e}"));
    assert!(report.is_empty());
    assert!(image.layer_fs_root().join("etc/x").exists());
}

#[test_log::test(tokio::test)]
async fn flat_image_as_base() {
    let w = world();
    let arch = w.machines.add_image("arch", true).unwrap();
    write(&arch.path, "etc/os-release", "arch");

    let web = w.ctl.create_image("web", Some("arch")).await.unwrap();
    assert_eq!(web.base_layers(), vec![arch.path.clone()]);
    assert_eq!(read(web.path(), "etc/os-release"), "arch");

    write(&web.layer_fs_root(), "etc/os-release", "arch");
    let report = web.optimize(&mut |_| {}, &mut |e| panic!("{e}"));
    assert_eq!(report.files_removed, 1);
}

#[test_log::test(tokio::test)]
async fn listing_merges_stores() {
    let w = world();
    w.machines.add_image("arch", true).unwrap();
    w.machines.add_image("zed", false).unwrap();
    w.ctl.create_image("base", None).await.unwrap();
    // machined also reports the mount point of a layered image.
    w.machines.add_image("base", false).unwrap();

    let images = w.ctl.list_images().await.unwrap();
    let rows: Vec<(String, String)> = images
        .iter()
        .map(|i| (i.name().to_string(), i.image_type().to_string()))
        .collect();
    assert_eq!(
        rows,
        vec![
            ("arch".to_string(), "directory".to_string()),
            ("base".to_string(), "layered".to_string()),
            ("zed".to_string(), "directory".to_string()),
        ]
    );
}

#[test_log::test(tokio::test)]
async fn work_dir_is_not_an_image() {
    let w = world();
    frozen_image(&w, "base", None, &[]).await;
    w.ctl.create_image("child", Some("base")).await.unwrap();
    assert!(w.paths.overlay_work().is_dir());

    let names: Vec<String> = w
        .ctl
        .layered()
        .list_images()
        .await
        .unwrap()
        .iter()
        .map(|i| i.name().to_string())
        .collect();
    assert_eq!(names, vec!["base".to_string(), "child".to_string()]);
}

#[test_log::test(tokio::test)]
async fn remove_deletes_layer_and_units() {
    let w = world();
    let mut image: AnyImage = w.ctl.create_image("web", None).await.unwrap().into();
    let names = MountUnitNames::for_path(image.path());

    image.remove().await.unwrap();
    assert!(!w.paths.layer_root("web").exists());
    assert!(!w.paths.image_path("web").exists());
    assert!(!w.paths.unit_file(&names.mount).exists());
    assert!(!w.paths.unit_file(&names.automount).exists());
    assert_eq!(w.ctl.get_image("web").await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[test_log::test(tokio::test)]
async fn rebase_moves_image_and_rejects_cycles() {
    let w = world();
    frozen_image(&w, "one", None, &[("etc/v", "1")]).await;
    frozen_image(&w, "two", None, &[("etc/v", "2")]).await;
    let mut web = w.ctl.create_image("web", Some("one")).await.unwrap();
    assert_eq!(read(web.path(), "etc/v"), "1");

    let two = w.ctl.get_image("two").await.unwrap();
    web.rebase(two).await.unwrap();
    assert_eq!(web.base_name(), Some("two"));
    assert!(web.ready());
    assert_eq!(read(web.path(), "etc/v"), "2");
    assert_eq!(read(&web.layer_root(), "base"), "two");

    web.set_read_only(true).await.unwrap();
    let mut two = w.ctl.get_layered("two", "rebase").await.unwrap();
    let web = w.ctl.get_image("web").await.unwrap();
    let err = two.rebase(web).await.unwrap_err();
    assert!(matches!(err, LaminaError::BaseCycle { .. }));
    assert!(two.base().is_none());

    let writable = w.ctl.create_image("scratch", None).await.unwrap();
    let err = two.rebase(writable.into()).await.unwrap_err();
    assert!(matches!(err, LaminaError::BaseWritable { .. }));
}

#[test_log::test(tokio::test)]
async fn missing_frozen_marker_is_a_caveat() {
    let w = world();
    frozen_image(&w, "base", None, &[]).await;
    fs::remove_file(w.paths.layer_root("base").join("frozen")).unwrap();

    let mut image = w.ctl.get_layered("base", "repair").await.unwrap();
    assert!(!image.read_only());
    assert!(image.caveats().contains(&Caveat::MissingFrozenMarker));

    image.repair().await.unwrap();
    assert!(image.caveats().is_empty());
    assert_eq!(read(&image.layer_root(), "frozen"), "n");
}

#[test_log::test(tokio::test)]
async fn interrupted_change_leaves_a_detectable_stale_mount() {
    let w = world();
    let mut image = w.ctl.create_image("web", None).await.unwrap();
    write(&image.layer_fs_root(), "etc/x", "1");
    let names = MountUnitNames::for_path(image.path());

    // The unmount step fails after the guard: the error surfaces and the
    // image keeps its mount.
    w.units.fail_unit(&names.mount, "timeout");
    let err = image.set_read_only(true).await.unwrap_err();
    assert!(matches!(err, LaminaError::UnitJob { ref result, .. } if result == "timeout"));
    w.units.clear_failure(&names.mount);

    // Simulate a crash after the metadata was written but before the remount.
    fs::write(image.layer_root().join("frozen"), "y").unwrap();

    let mut image = w.ctl.get_layered("web", "repair").await.unwrap();
    assert!(image.ready());
    assert!(image.read_only());
    assert!(matches!(
        image.caveats(),
        [Caveat::StaleMount { installed: Some(_), .. }]
    ));

    image.repair().await.unwrap();
    assert!(image.caveats().is_empty());
    let reloaded = w.ctl.get_layered("web", "repair").await.unwrap();
    assert!(reloaded.caveats().is_empty());
    assert_eq!(reloaded.expected_mount().options, "bind,ro");
    assert_eq!(read(reloaded.path(), "etc/x"), "1");
}

#[test_log::test(tokio::test)]
async fn flat_images_cannot_be_rebased() {
    let w = world();
    w.machines.add_image("arch", true).unwrap();
    let err = w.ctl.get_layered("arch", "rebase").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Impossible);
}

#[test_log::test(tokio::test)]
async fn base_with_dependents_cannot_be_removed() {
    let w = world();
    let mut base = frozen_image(&w, "base", None, &[("etc/x", "v1")]).await;
    let mut child = w.ctl.create_image("child", Some("base")).await.unwrap();

    let err = base.remove().await.unwrap_err();
    assert!(matches!(err, LaminaError::BaseInUse { ref dependents, .. } if dependents == "child"));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(base.ready());
    assert!(base.layer_root().is_dir());

    child.remove().await.unwrap();
    base.remove().await.unwrap();
    assert!(w.ctl.list_images().await.unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn image_outlives_its_removed_base() {
    let w = world();
    w.machines.add_image("arch", true).unwrap();
    w.ctl.create_image("web", Some("arch")).await.unwrap();
    // Registry images do not know what is built on them.
    w.ctl.get_image("arch").await.unwrap().remove().await.unwrap();

    let mut web = w.ctl.get_layered("web", "inspect").await.unwrap();
    assert_eq!(web.caveats(), [Caveat::MissingBase {
        name: "arch".to_string()
    }]);
    assert_eq!(web.base_name(), None);
    assert_eq!(web.missing_ancestor(), Some("arch"));
    assert!(web.ready());

    let names: Vec<String> = w
        .ctl
        .list_images()
        .await
        .unwrap()
        .iter()
        .map(|i| i.name().to_string())
        .collect();
    assert_eq!(names, ["web"]);

    web.set_ready(false).await.unwrap();
    let err = web.set_ready(true).await.unwrap_err();
    assert!(matches!(err, LaminaError::BaseDoesNotExist { ref name } if name == "arch"));
    assert!(!web.ready());

    let mut errors = Vec::new();
    let report = web.optimize(&mut |_| {}, &mut |e| errors.push(e));
    assert!(report.is_empty());
    assert!(matches!(errors.as_slice(), [LaminaError::BaseDoesNotExist { .. }]));

    // The persisted base name survives metadata rewrites.
    web.set_read_only(true).await.unwrap();
    assert_eq!(read(&web.layer_root(), "base"), "arch");

    let mut web = w.ctl.get_image("web").await.unwrap();
    web.remove().await.unwrap();
    assert!(w.ctl.get_image("web").await.unwrap_err().is_not_found());
    assert!(!w.paths.layer_root("web").exists());
}

#[test_log::test(tokio::test)]
async fn orphan_can_be_rebased() {
    let w = world();
    w.machines.add_image("arch", true).unwrap();
    frozen_image(&w, "next", None, &[("etc/os", "next")]).await;
    w.ctl.create_image("web", Some("arch")).await.unwrap();
    w.ctl.get_image("arch").await.unwrap().remove().await.unwrap();

    let mut web = w.ctl.get_layered("web", "rebase").await.unwrap();
    let next = w.ctl.get_image("next").await.unwrap();
    web.rebase(next).await.unwrap();
    assert!(web.caveats().is_empty());
    assert_eq!(web.base_name(), Some("next"));
    assert!(web.ready());

    let reloaded = w.ctl.get_layered("web", "inspect").await.unwrap();
    assert!(reloaded.caveats().is_empty());
    assert_eq!(read(reloaded.path(), "etc/os"), "next");
}

#[test_log::test(tokio::test)]
async fn children_of_an_orphan_cannot_mount() {
    let w = world();
    frozen_image(&w, "base", None, &[]).await;
    frozen_image(&w, "mid", Some("base"), &[]).await;
    // Deleted behind the store's back.
    fs::remove_dir_all(w.paths.layer_root("base")).unwrap();

    let mid = w.ctl.get_image("mid").await.unwrap();
    assert_eq!(mid.caveats(), [Caveat::MissingBase {
        name: "base".to_string()
    }]);
    let err = w.ctl.create_image("leaf", Some("mid")).await.unwrap_err();
    assert!(matches!(err, LaminaError::BaseDoesNotExist { ref name } if name == "base"));
    assert!(!w.paths.layer_root("leaf").exists());
}

#[test_log::test(tokio::test)]
async fn persisted_base_loops_are_detected() {
    let w = world();
    frozen_image(&w, "a", None, &[]).await;
    frozen_image(&w, "b", Some("a"), &[]).await;
    fs::write(w.paths.layer_root("a").join("base"), "b").unwrap();

    for name in ["a", "b"] {
        let err = w.ctl.get_image(name).await.unwrap_err();
        assert!(matches!(err, LaminaError::BaseCycle { .. }), "{name}: {err}");
    }
    assert!(w.ctl.list_images().await.unwrap().is_empty());

    // A loop through a tag.
    frozen_image(&w, "c", None, &[]).await;
    w.ctl.tag("latest", "c").await.unwrap();
    fs::write(w.paths.layer_root("c").join("base"), "latest").unwrap();
    let err = w.ctl.get_image("c").await.unwrap_err();
    assert!(matches!(err, LaminaError::BaseCycle { .. }), "{err}");
}

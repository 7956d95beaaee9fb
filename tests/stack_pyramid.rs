//! Stack assembly and pyramid generation end-to-end tests.

use std::path::Path;

use zarrs::array_subset::ArraySubset;
use zarrs::group::Group;

use plate_pyramid::metadata::{
    load_multiscales, store_multiscales, AxisMetadata, LevelDescriptor, MultiscaleImage,
};
use plate_pyramid::pixel::PixelType;
use plate_pyramid::pyramid::{build_pyramid, PyramidConfig, StopRule};
use plate_pyramid::reduction::{ChannelReductions, ReductionMethod};
use plate_pyramid::stack::{
    assemble_stack, Plane, PlaneReadError, PlaneSource, StackAxis, StackConfig, StackError,
};
use plate_pyramid::storage::{
    open_level_array, open_or_create_root_group, open_store, Compression,
};

/// A synthetic plane: constant-filled, with optional patch overrides and an
/// optional injected failure.
struct TestPlane {
    height: u64,
    width: u64,
    fill: u16,
    patch: Vec<(u64, u64, u16)>,
    fail: bool,
}

impl TestPlane {
    fn filled(height: u64, width: u64, fill: u16) -> Self {
        Self {
            height,
            width,
            fill,
            patch: Vec::new(),
            fail: false,
        }
    }

    fn failing(height: u64, width: u64) -> Self {
        Self {
            fail: true,
            ..Self::filled(height, width, 0)
        }
    }

    fn with_patch(mut self, patch: &[(u64, u64, u16)]) -> Self {
        self.patch = patch.to_vec();
        self
    }
}

impl PlaneSource<u16> for TestPlane {
    fn extents(&self) -> Result<(u64, u64), PlaneReadError> {
        Ok((self.height, self.width))
    }

    fn read(&self) -> Result<Plane<u16>, PlaneReadError> {
        if self.fail {
            return Err("injected decode failure".into());
        }
        let mut data = vec![self.fill; (self.height * self.width) as usize];
        for &(y, x, value) in &self.patch {
            data[(y * self.width + x) as usize] = value;
        }
        Ok(Plane {
            height: self.height,
            width: self.width,
            data,
        })
    }
}

fn small_config() -> StackConfig {
    StackConfig {
        chunk_edge: 16,
        compression: Compression::None,
    }
}

fn read_region(
    root: &Path,
    level: u64,
    ranges: &[std::ops::Range<u64>; 5],
) -> Vec<u16> {
    let store = open_store(root).unwrap();
    let array = open_level_array(&store, level).unwrap();
    array
        .retrieve_array_subset_elements::<u16>(&ArraySubset::new_with_ranges(ranges))
        .unwrap()
}

#[test]
fn planes_land_in_ascending_slot_order() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().join("stack.zarr");
    // Deliberately unsorted grouping indices with gaps.
    let planes = vec![
        (5u64, TestPlane::filled(16, 16, 50)),
        (1, TestPlane::filled(16, 16, 10)),
        (9, TestPlane::filled(16, 16, 90)),
    ];

    let report =
        assemble_stack(&planes, StackAxis::Channel, &root, "stack", &small_config()).unwrap();
    assert!(report.is_complete());
    assert_eq!(report.written, 3);
    assert_eq!(report.shape, vec![1, 3, 1, 16, 16]);

    for (slot, expected) in [(0u64, 10u16), (1, 50), (2, 90)] {
        let values = read_region(&root, 0, &[0..1, slot..slot + 1, 0..1, 0..16, 0..16]);
        assert!(values.iter().all(|&pixel| pixel == expected), "slot {slot}");
    }
}

#[test]
fn stacking_axis_selects_the_dimension() {
    let dir = tempfile::TempDir::new().unwrap();
    let planes: Vec<(u64, TestPlane)> = (0..3)
        .map(|index| (index, TestPlane::filled(16, 16, index as u16)))
        .collect();

    let z_root = dir.path().join("volume.zarr");
    let report =
        assemble_stack(&planes, StackAxis::Z, &z_root, "volume", &small_config()).unwrap();
    assert_eq!(report.shape, vec![1, 1, 3, 16, 16]);

    let planes: Vec<(u64, TestPlane)> = (0..2)
        .map(|index| (index, TestPlane::filled(16, 16, index as u16)))
        .collect();
    let t_root = dir.path().join("series.zarr");
    let report =
        assemble_stack(&planes, StackAxis::Time, &t_root, "series", &small_config()).unwrap();
    assert_eq!(report.shape, vec![2, 1, 1, 16, 16]);
}

#[test]
fn failed_planes_degrade_to_zero_filled_slots() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().join("stack.zarr");
    let planes = vec![
        (0u64, TestPlane::filled(16, 16, 11)),
        (1, TestPlane::failing(16, 16)),
        (2, TestPlane::filled(16, 16, 33)),
    ];

    let report =
        assemble_stack(&planes, StackAxis::Channel, &root, "stack", &small_config()).unwrap();
    assert!(!report.is_complete());
    assert_eq!(report.written, 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].index, 1);

    let failed_slot = read_region(&root, 0, &[0..1, 1..2, 0..1, 0..16, 0..16]);
    assert!(failed_slot.iter().all(|&pixel| pixel == 0));
    let intact_slot = read_region(&root, 0, &[0..1, 2..3, 0..1, 0..16, 0..16]);
    assert!(intact_slot.iter().all(|&pixel| pixel == 33));
}

#[test]
fn mismatched_plane_extents_are_recorded_not_raised() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().join("stack.zarr");
    let planes = vec![
        (0u64, TestPlane::filled(16, 16, 1)),
        (1, TestPlane::filled(8, 8, 2)),
    ];

    let report =
        assemble_stack(&planes, StackAxis::Channel, &root, "stack", &small_config()).unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].index, 1);
}

#[test]
fn empty_plane_collection_is_an_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let planes: Vec<(u64, TestPlane)> = Vec::new();
    assert!(matches!(
        assemble_stack(
            &planes,
            StackAxis::Channel,
            &dir.path().join("stack.zarr"),
            "stack",
            &small_config()
        ),
        Err(StackError::Empty)
    ));
}

#[test]
fn existing_axis_annotations_are_preserved() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().join("stack.zarr");

    // Another tool annotated the axes with nanometer units beforehand.
    let mut axes = plate_pyramid::metadata::default_axes();
    for axis in &mut axes {
        if axis.kind == "space" {
            axis.unit = Some("nanometer".to_string());
        }
    }
    {
        let store = open_store(&root).unwrap();
        let mut group = open_or_create_root_group(&store).unwrap();
        let document = MultiscaleImage::new(
            "preexisting",
            axes.clone(),
            &[LevelDescriptor::base(vec![1, 1, 1, 16, 16])],
            "mean",
        );
        store_multiscales(&mut group, &document).unwrap();
    }

    let planes = vec![(0u64, TestPlane::filled(16, 16, 7))];
    assemble_stack(&planes, StackAxis::Channel, &root, "stack", &small_config()).unwrap();

    let store = open_store(&root).unwrap();
    let group = Group::open(store, "/").unwrap();
    let document = load_multiscales(&group).unwrap();
    let space_units: Vec<&AxisMetadata> = document
        .axes
        .iter()
        .filter(|axis| axis.kind == "space")
        .collect();
    assert!(!space_units.is_empty());
    assert!(space_units
        .iter()
        .all(|axis| axis.unit.as_deref() == Some("nanometer")));
}

#[test]
fn pyramid_mean_reduces_and_stops_at_the_floor() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().join("image.zarr");
    let planes = vec![(
        0u64,
        TestPlane::filled(8, 8, 1).with_patch(&[(0, 0, 8), (0, 1, 9), (1, 0, 7), (1, 1, 14)]),
    )];
    assemble_stack(
        &planes,
        StackAxis::Channel,
        &root,
        "image",
        &StackConfig {
            chunk_edge: 4,
            compression: Compression::None,
        },
    )
    .unwrap();

    let levels = build_pyramid(
        &root,
        &ChannelReductions::uniform(ReductionMethod::Mean),
        &PyramidConfig {
            chunk_edge: 4,
            compression: Compression::None,
            stop: StopRule::MinDimension(2),
        },
    )
    .unwrap();

    // 8 -> 4 -> 2; a further halving would fall below the floor.
    assert_eq!(levels.len(), 3);
    assert_eq!(levels[1].shape, vec![1, 1, 1, 4, 4]);
    assert_eq!(levels[2].shape, vec![1, 1, 1, 2, 2]);
    assert_eq!(levels[1].scale, vec![1.0, 1.0, 1.0, 2.0, 2.0]);
    assert_eq!(levels[2].scale, vec![1.0, 1.0, 1.0, 4.0, 4.0]);

    // mean([8, 9, 7, 14]) = 9.5 -> 10; everything else stays 1.
    let level1 = read_region(&root, 1, &[0..1, 0..1, 0..1, 0..4, 0..4]);
    assert_eq!(level1[0], 10);
    assert!(level1[1..].iter().all(|&pixel| pixel == 1));
}

#[test]
fn per_channel_reduction_methods_are_honored() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().join("image.zarr");
    let tie_patch = [(0u64, 0u64, 8u16), (0, 1, 8), (1, 0, 9), (1, 1, 9)];
    let planes = vec![
        (0u64, TestPlane::filled(4, 4, 1).with_patch(&tie_patch)),
        (1, TestPlane::filled(4, 4, 1).with_patch(&tie_patch)),
    ];
    assemble_stack(
        &planes,
        StackAxis::Channel,
        &root,
        "image",
        &StackConfig {
            chunk_edge: 4,
            compression: Compression::None,
        },
    )
    .unwrap();

    let reductions =
        ChannelReductions::from_names([(0u64, "mode_max"), (1, "mode_min")]).unwrap();
    build_pyramid(
        &root,
        &reductions,
        &PyramidConfig {
            chunk_edge: 4,
            compression: Compression::None,
            stop: StopRule::Levels(2),
        },
    )
    .unwrap();

    // The tied 2x2 neighborhood [8, 8, 9, 9] resolves per channel.
    let channel0 = read_region(&root, 1, &[0..1, 0..1, 0..1, 0..1, 0..1]);
    assert_eq!(channel0, vec![9]);
    let channel1 = read_region(&root, 1, &[0..1, 1..2, 0..1, 0..1, 0..1]);
    assert_eq!(channel1, vec![8]);
}

#[test]
fn explicit_level_count_is_respected() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().join("image.zarr");
    let planes = vec![(0u64, TestPlane::filled(32, 32, 3))];
    assemble_stack(
        &planes,
        StackAxis::Channel,
        &root,
        "image",
        &StackConfig {
            chunk_edge: 8,
            compression: Compression::None,
        },
    )
    .unwrap();

    let levels = build_pyramid(
        &root,
        &ChannelReductions::default(),
        &PyramidConfig {
            chunk_edge: 8,
            compression: Compression::None,
            stop: StopRule::Levels(2),
        },
    )
    .unwrap();
    assert_eq!(levels.len(), 2);
    assert_eq!(levels[1].shape, vec![1, 1, 1, 16, 16]);
}

#[test]
fn multiscale_document_lists_every_level() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().join("image.zarr");
    let planes = vec![(0u64, TestPlane::filled(16, 16, 2))];
    assemble_stack(
        &planes,
        StackAxis::Channel,
        &root,
        "image",
        &StackConfig {
            chunk_edge: 4,
            compression: Compression::None,
        },
    )
    .unwrap();

    build_pyramid(
        &root,
        &ChannelReductions::uniform(ReductionMethod::ModeMax),
        &PyramidConfig {
            chunk_edge: 4,
            compression: Compression::None,
            stop: StopRule::Levels(3),
        },
    )
    .unwrap();

    let store = open_store(&root).unwrap();
    let group = Group::open(store.clone(), "/").unwrap();
    let document = load_multiscales(&group).unwrap();
    assert_eq!(document.name, "image");
    assert_eq!(document.metadata.method, "mode_max");
    assert_eq!(document.level_indices().unwrap(), vec![0, 1, 2]);

    // Every dataset path opens to an array of the expected shape.
    for (index, expected) in [(0u64, 16u64), (1, 8), (2, 4)] {
        let array = open_level_array(&store, index).unwrap();
        assert_eq!(array.shape(), &[1, 1, 1, expected, expected]);
    }
}

#[test]
fn volumes_reduce_z_alongside_y_and_x() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().join("volume.zarr");
    let planes: Vec<(u64, TestPlane)> = (0..4)
        .map(|index| (index, TestPlane::filled(8, 8, index as u16)))
        .collect();
    assemble_stack(
        &planes,
        StackAxis::Z,
        &root,
        "volume",
        &StackConfig {
            chunk_edge: 4,
            compression: Compression::None,
        },
    )
    .unwrap();

    let levels = build_pyramid(
        &root,
        &ChannelReductions::default(),
        &PyramidConfig {
            chunk_edge: 4,
            compression: Compression::None,
            stop: StopRule::Levels(2),
        },
    )
    .unwrap();
    assert_eq!(levels[1].shape, vec![1, 1, 2, 4, 4]);
    assert_eq!(levels[1].scale, vec![1.0, 1.0, 2.0, 2.0, 2.0]);

    // Each 2x2x2 block spans two constant planes: mean(0, 1) = 0.5 -> 1.
    let level1 = read_region(&root, 1, &[0..1, 0..1, 0..1, 0..1, 0..1]);
    assert_eq!(level1, vec![1]);
    // The second Z slot reduces planes 2 and 3: mean = 2.5 -> 3.
    let level1 = read_region(&root, 1, &[0..1, 0..1, 1..2, 0..1, 0..1]);
    assert_eq!(level1, vec![3]);
}

#[test]
fn pixel_type_is_recorded_in_the_sidecar() {
    let dir = tempfile::TempDir::new().unwrap();
    let root = dir.path().join("stack.zarr");
    let planes = vec![(0u64, TestPlane::filled(16, 16, 4))];
    assemble_stack(&planes, StackAxis::Channel, &root, "stack", &small_config()).unwrap();

    let sidecar = plate_pyramid::metadata::read_ome_sidecar(&root).unwrap();
    assert_eq!(sidecar.pixel_type, PixelType::UInt16.ome_name());
    assert_eq!(sidecar.size_y, 16);
    assert_eq!(sidecar.size_c, 1);
}

use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Largest value file we expect under sysfs; longer contents are truncated.
const SENSOR_READ_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct SensorSpec {
    pub name: &'static str,
    pub file: &'static str,
    pub pattern: bool,
}

impl SensorSpec {
    pub const fn exact(name: &'static str, file: &'static str) -> Self {
        Self {
            name,
            file,
            pattern: false,
        }
    }

    /// `file` is a regex with exactly one capture group holding a numeric index.
    pub const fn pattern(name: &'static str, file: &'static str) -> Self {
        Self {
            name,
            file,
            pattern: true,
        }
    }
}

#[derive(Debug, Default)]
struct Sensor {
    file: Option<File>,
    value: u64,
}

#[derive(Debug, Default)]
pub struct Hwmon {
    base_dir: Option<PathBuf>,
    sensors: BTreeMap<&'static str, Sensor>,
}

impl Hwmon {
    pub fn setup(base_dir: Option<PathBuf>, specs: &[SensorSpec]) -> Self {
        let resolved = match &base_dir {
            Some(dir) => resolve_sensors(dir, specs),
            None => {
                warn!("hwmon base directory unknown, sensors will read as zero");
                HashMap::new()
            }
        };

        let mut sensors = BTreeMap::new();
        for spec in specs {
            let mut sensor = Sensor::default();
            match resolved.get(spec.name) {
                Some(path) => match File::open(path) {
                    Ok(file) => {
                        debug!(sensor = spec.name, path = %path.display(), "hwmon reading found");
                        sensor.file = Some(file);
                    }
                    Err(err) => {
                        debug!(sensor = spec.name, path = %path.display(), error = %err, "failed to open hwmon reading");
                    }
                },
                None => debug!(sensor = spec.name, "hwmon reading not found"),
            }
            sensors.insert(spec.name, sensor);
        }

        Self { base_dir, sensors }
    }

    pub fn base_dir(&self) -> Option<&Path> {
        self.base_dir.as_deref()
    }

    /// Re-reads every resolved sensor. Empty or unparsable contents keep the
    /// previous value.
    pub fn poll(&mut self) {
        for sensor in self.sensors.values_mut() {
            let Some(file) = sensor.file.as_ref() else {
                continue;
            };
            if let Some(value) = read_sensor(file) {
                sensor.value = value;
            }
        }
    }

    pub fn value(&self, name: &str) -> u64 {
        self.sensors.get(name).map(|s| s.value).unwrap_or(0)
    }

    pub fn has(&self, name: &str) -> bool {
        self.sensors
            .get(name)
            .map(|s| s.file.is_some())
            .unwrap_or(false)
    }
}

fn read_sensor(file: &File) -> Option<u64> {
    let mut buf = [0_u8; SENSOR_READ_LIMIT];
    let n = file.read_at(&mut buf, 0).ok()?;
    let text = std::str::from_utf8(&buf[..n]).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    text.parse().ok()
}

/// Pattern sensors pick the match with the lowest captured index.
pub fn resolve_sensors(dir: &Path, specs: &[SensorSpec]) -> HashMap<&'static str, PathBuf> {
    let mut regexes: HashMap<&'static str, Regex> = HashMap::new();
    for spec in specs.iter().filter(|s| s.pattern) {
        match Regex::new(&format!("^(?:{})$", spec.file)) {
            Ok(rx) if rx.captures_len() == 2 => {
                regexes.insert(spec.name, rx);
            }
            Ok(_) => warn!(sensor = spec.name, pattern = spec.file, "sensor pattern needs exactly one capture group"),
            Err(err) => warn!(sensor = spec.name, error = %err, "invalid sensor pattern"),
        }
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "cannot list hwmon directory");
            return HashMap::new();
        }
    };

    let mut best: HashMap<&'static str, (u64, PathBuf)> = HashMap::new();
    let mut exact: HashMap<&'static str, PathBuf> = HashMap::new();

    for entry in entries.flatten() {
        let filename = entry.file_name();
        let Some(filename) = filename.to_str() else {
            continue;
        };

        for spec in specs {
            if !spec.pattern {
                if filename == spec.file {
                    exact.insert(spec.name, entry.path());
                }
                continue;
            }

            let Some(rx) = regexes.get(spec.name) else {
                continue;
            };
            let Some(index) = rx
                .captures(filename)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<u64>().ok())
            else {
                continue;
            };
            match best.get(spec.name) {
                Some((current, _)) if *current <= index => {}
                _ => {
                    best.insert(spec.name, (index, entry.path()));
                }
            }
        }
    }

    exact.extend(best.into_iter().map(|(name, (_, path))| (name, path)));
    exact
}

pub fn find_hwmon_dir(drm_class: &Path, drm_node: &str) -> Option<PathBuf> {
    let dir = drm_class.join(drm_node).join("device").join("hwmon");
    let mut candidates: Vec<PathBuf> = match fs::read_dir(&dir) {
        Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
        Err(_) => {
            debug!(dir = %dir.display(), "hwmon directory doesn't exist");
            return None;
        }
    };
    candidates.sort();
    let found = candidates.into_iter().next();
    if found.is_none() {
        debug!(dir = %dir.display(), "hwmon directory is empty");
    }
    found
}

pub fn find_hwmon_dir_by_name(hwmon_class: &Path, name: &str) -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = match fs::read_dir(hwmon_class) {
        Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
        Err(_) => {
            debug!(dir = %hwmon_class.display(), "hwmon class directory doesn't exist");
            return None;
        }
    };
    dirs.sort();

    dirs.into_iter().find(|dir| {
        fs::read_to_string(dir.join("name"))
            .ok()
            .and_then(|content| content.lines().next().map(|l| l.contains(name)))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn pattern_prefers_lowest_index() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "temp10_input", "10000\n");
        touch(dir.path(), "temp3_input", "30000\n");
        touch(dir.path(), "temp2_input", "20000\n");
        touch(dir.path(), "temp2_label", "junction\n");

        let specs = [SensorSpec::pattern("temp", r"temp(\d+)_input")];
        let resolved = resolve_sensors(dir.path(), &specs);
        assert_eq!(resolved["temp"], dir.path().join("temp2_input"));
    }

    #[test]
    fn exact_names_match_whole_filename() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "power1_cap_max", "1\n");
        touch(dir.path(), "power1_cap", "2\n");

        let specs = [SensorSpec::exact("power_limit", "power1_cap")];
        let resolved = resolve_sensors(dir.path(), &specs);
        assert_eq!(resolved["power_limit"], dir.path().join("power1_cap"));
    }

    #[test]
    fn missing_limit_reads_zero_while_fan_reads_value() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "fan1_input", "1450\n");

        let mut hwmon = Hwmon::setup(
            Some(dir.path().to_path_buf()),
            &[
                SensorSpec::exact("fan_speed", "fan1_input"),
                SensorSpec::exact("power_limit", "power1_max"),
            ],
        );
        hwmon.poll();

        assert_eq!(hwmon.value("fan_speed"), 1450);
        assert_eq!(hwmon.value("power_limit"), 0);
        assert!(!hwmon.has("power_limit"));
        assert_eq!(hwmon.value("not_registered"), 0);
    }

    #[test]
    fn bad_reads_keep_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "in0_input", "850\n");

        let mut hwmon = Hwmon::setup(
            Some(dir.path().to_path_buf()),
            &[SensorSpec::exact("voltage", "in0_input")],
        );
        hwmon.poll();
        assert_eq!(hwmon.value("voltage"), 850);

        touch(dir.path(), "in0_input", "");
        hwmon.poll();
        assert_eq!(hwmon.value("voltage"), 850);

        touch(dir.path(), "in0_input", "garbage");
        hwmon.poll();
        assert_eq!(hwmon.value("voltage"), 850);

        touch(dir.path(), "in0_input", "900\n");
        hwmon.poll();
        assert_eq!(hwmon.value("voltage"), 900);
    }

    #[test]
    fn no_base_dir_means_zeroes() {
        let mut hwmon = Hwmon::setup(None, &[SensorSpec::exact("temp", "temp1_input")]);
        hwmon.poll();
        assert_eq!(hwmon.value("temp"), 0);
    }

    #[test]
    fn finds_hwmon_by_name_substring() {
        let class = tempfile::tempdir().unwrap();
        for (dir, name) in [("hwmon0", "acpitz"), ("hwmon1", "k10temp"), ("hwmon2", "k10temp")] {
            let d = class.path().join(dir);
            fs::create_dir(&d).unwrap();
            touch(&d, "name", &format!("{name}\n"));
        }

        let found = find_hwmon_dir_by_name(class.path(), "k10");
        assert_eq!(found, Some(class.path().join("hwmon1")));
        assert_eq!(find_hwmon_dir_by_name(class.path(), "coretemp"), None);
    }

    #[test]
    fn finds_hwmon_under_drm_node() {
        let drm = tempfile::tempdir().unwrap();
        let hw = drm.path().join("card1/device/hwmon/hwmon4");
        fs::create_dir_all(&hw).unwrap();

        assert_eq!(find_hwmon_dir(drm.path(), "card1"), Some(hw));
        assert_eq!(find_hwmon_dir(drm.path(), "card0"), None);
    }
}

//! Acoustic beacon matching corroborated by the location service
//!
//! Each spot of a zone broadcasts a single tone. A spot is detected once
//! its tone dominates enough consecutive windows, and validated once the
//! location fix places the device inside the zone (or immediately, in
//! high-accuracy mode).

use std::sync::Arc;

use log::{debug, info};

use crate::error::Result;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// One acoustic beacon
#[derive(Debug, Clone, PartialEq)]
pub struct Spot {
    pub id: String,
    pub frequency_hz: f32,
    pub place: String,
    pub promotion: Option<String>,
}

/// A physical area and the beacons installed in it
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
    pub spots: Vec<Spot>,
}

/// Raw position reported by the location service
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters
    pub accuracy_m: f64,
}

/// Receives fixes from a [`LocationProvider`]
pub trait LocationListener: Send + Sync {
    fn on_fix(&self, fix: LocationFix);
}

/// Capability to stream position updates
pub trait LocationProvider: Send {
    fn start_updates(&mut self, listener: Arc<dyn LocationListener>) -> Result<()>;
    fn stop_updates(&mut self);
}

/// A spot that passed validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedLocation {
    pub spot_id: String,
    pub place: String,
    pub promotion: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GeoState {
    pub(crate) zone: Option<Zone>,
    pub(crate) candidate: Option<usize>,
    pub(crate) candidate_count: usize,
    pub(crate) last_detected: Option<usize>,
    pub(crate) last_validated: Option<usize>,
    pub(crate) in_zone: bool,
    pub(crate) fix: Option<LocationFix>,
    pub(crate) high_accuracy: bool,
}

impl GeoState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a zone, forgetting detections from any previous one. The last
    /// known fix and the accuracy mode survive.
    pub fn activate(&mut self, zone: Zone) {
        self.zone = Some(zone);
        self.candidate = None;
        self.candidate_count = 0;
        self.last_detected = None;
        self.last_validated = None;
        self.in_zone = self.fix.map_or(false, |fix| self.contains(fix));
    }

    pub fn deactivate(&mut self) {
        self.zone = None;
        self.candidate = None;
        self.candidate_count = 0;
    }

    pub fn zone(&self) -> Option<&Zone> {
        self.zone.as_ref()
    }

    pub fn in_zone(&self) -> bool {
        self.in_zone
    }

    pub fn fix(&self) -> Option<LocationFix> {
        self.fix
    }

    pub fn high_accuracy(&self) -> bool {
        self.high_accuracy
    }

    pub fn last_detected(&self) -> Option<&Spot> {
        self.spot(self.last_detected)
    }

    pub fn last_validated(&self) -> Option<&Spot> {
        self.spot(self.last_validated)
    }

    fn spot(&self, index: Option<usize>) -> Option<&Spot> {
        let zone = self.zone.as_ref()?;
        zone.spots.get(index?)
    }

    fn contains(&self, fix: LocationFix) -> bool {
        match &self.zone {
            Some(zone) => {
                let distance =
                    haversine_m(zone.latitude, zone.longitude, fix.latitude, fix.longitude);
                distance <= zone.radius_m + fix.accuracy_m.max(0.0)
            }
            None => false,
        }
    }

    fn corroborated(&self) -> bool {
        self.high_accuracy || self.in_zone
    }

    /// Validate the last detected spot if it is corroborated and differs
    /// from the previously validated one
    fn try_validate(&mut self) -> Option<ValidatedLocation> {
        let index = self.last_detected?;
        if !self.corroborated() || self.last_validated == Some(index) {
            return None;
        }
        let spot = self.zone.as_ref()?.spots.get(index)?;
        let validated = ValidatedLocation {
            spot_id: spot.id.clone(),
            place: spot.place.clone(),
            promotion: spot.promotion.clone(),
        };
        self.last_validated = Some(index);
        info!("location validated: {} ({})", validated.place, validated.spot_id);
        Some(validated)
    }
}

/// Great-circle distance in meters
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Interprets dominant frequencies against the beacons of the active zone
#[derive(Debug, Clone, Copy)]
pub struct ZoneMatcher {
    tolerance_hz: f32,
    confirmations: usize,
}

impl ZoneMatcher {
    pub fn new(tolerance_hz: f32, confirmations: usize) -> Self {
        Self {
            tolerance_hz,
            confirmations: confirmations.max(1),
        }
    }

    /// Nearest beacon of the zone within tolerance
    pub fn match_spot(&self, zone: &Zone, hz: f32) -> Option<usize> {
        zone.spots
            .iter()
            .enumerate()
            .map(|(i, spot)| (i, (spot.frequency_hz - hz).abs()))
            .filter(|&(_, delta)| delta <= self.tolerance_hz)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }

    /// Feed one analysis window. Quiet windows are ignored; a window that
    /// matches no beacon breaks the current run.
    pub fn accept_frequency(
        &self,
        geo: &mut GeoState,
        hz: f32,
        level: f32,
        minimum_volume: f32,
    ) -> Option<ValidatedLocation> {
        if level < minimum_volume {
            return None;
        }
        let matched = geo.zone.as_ref().and_then(|zone| self.match_spot(zone, hz));
        let index = match matched {
            Some(index) => index,
            None => {
                geo.candidate = None;
                geo.candidate_count = 0;
                return None;
            }
        };

        if geo.candidate == Some(index) {
            geo.candidate_count += 1;
        } else {
            geo.candidate = Some(index);
            geo.candidate_count = 1;
        }
        if geo.candidate_count < self.confirmations {
            return None;
        }

        if geo.last_detected != Some(index) {
            debug!("beacon {} detected", index);
        }
        geo.last_detected = Some(index);
        geo.try_validate()
    }

    /// Record a fix from the location service; may validate a spot that
    /// was detected while the device was still outside the zone.
    pub fn update_fix(&self, geo: &mut GeoState, fix: LocationFix) -> Option<ValidatedLocation> {
        geo.fix = Some(fix);
        geo.in_zone = geo.contains(fix);
        geo.try_validate()
    }

    pub fn set_high_accuracy(
        &self,
        geo: &mut GeoState,
        enabled: bool,
    ) -> Option<ValidatedLocation> {
        geo.high_accuracy = enabled;
        geo.try_validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> Zone {
        Zone {
            name: "Mall".to_owned(),
            latitude: 48.8566,
            longitude: 2.3522,
            radius_m: 150.0,
            spots: vec![
                Spot {
                    id: "A".to_owned(),
                    frequency_hz: 18_000.0,
                    place: "Entrance".to_owned(),
                    promotion: None,
                },
                Spot {
                    id: "B".to_owned(),
                    frequency_hz: 18_200.0,
                    place: "Food court".to_owned(),
                    promotion: Some("2 for 1".to_owned()),
                },
            ],
        }
    }

    const INSIDE: LocationFix = LocationFix {
        latitude: 48.8570,
        longitude: 2.3525,
        accuracy_m: 10.0,
    };

    const FAR_AWAY: LocationFix = LocationFix {
        latitude: 45.7640,
        longitude: 4.8357,
        accuracy_m: 10.0,
    };

    #[test]
    fn test_haversine_known_distance() {
        // Paris to Lyon is roughly 392 km.
        let d = haversine_m(48.8566, 2.3522, 45.7640, 4.8357);
        assert!((d - 392_000.0).abs() < 5_000.0, "{}", d);
        assert!(haversine_m(10.0, 10.0, 10.0, 10.0) < 1e-6);
    }

    #[test]
    fn test_match_nearest_within_tolerance() {
        let matcher = ZoneMatcher::new(15.0, 1);
        let zone = zone();
        assert_eq!(matcher.match_spot(&zone, 18_010.0), Some(0));
        assert_eq!(matcher.match_spot(&zone, 18_195.0), Some(1));
        assert_eq!(matcher.match_spot(&zone, 18_100.0), None);
    }

    #[test]
    fn test_requires_consecutive_confirmations() {
        let matcher = ZoneMatcher::new(15.0, 3);
        let mut geo = GeoState::new();
        geo.activate(zone());
        matcher.update_fix(&mut geo, INSIDE);

        assert_eq!(matcher.accept_frequency(&mut geo, 18_200.0, 1.0, 0.1), None);
        assert_eq!(matcher.accept_frequency(&mut geo, 18_200.0, 1.0, 0.1), None);
        // Unknown tone breaks the run.
        assert_eq!(matcher.accept_frequency(&mut geo, 9_000.0, 1.0, 0.1), None);
        assert_eq!(matcher.accept_frequency(&mut geo, 18_200.0, 1.0, 0.1), None);
        assert_eq!(matcher.accept_frequency(&mut geo, 18_200.0, 1.0, 0.1), None);
        let validated = matcher.accept_frequency(&mut geo, 18_200.0, 1.0, 0.1).unwrap();
        assert_eq!(validated.place, "Food court");
        assert_eq!(validated.promotion.as_deref(), Some("2 for 1"));
    }

    #[test]
    fn test_outside_zone_waits_for_fix() {
        let matcher = ZoneMatcher::new(15.0, 1);
        let mut geo = GeoState::new();
        geo.activate(zone());
        matcher.update_fix(&mut geo, FAR_AWAY);

        assert_eq!(matcher.accept_frequency(&mut geo, 18_000.0, 1.0, 0.1), None);
        assert_eq!(geo.last_detected().map(|s| s.id.as_str()), Some("A"));
        assert!(geo.last_validated().is_none());

        let validated = matcher.update_fix(&mut geo, INSIDE).unwrap();
        assert_eq!(validated.spot_id, "A");
    }

    #[test]
    fn test_high_accuracy_allows_acoustic_only() {
        let matcher = ZoneMatcher::new(15.0, 1);
        let mut geo = GeoState::new();
        geo.activate(zone());
        assert!(matcher.set_high_accuracy(&mut geo, true).is_none());
        assert!(matcher.accept_frequency(&mut geo, 18_000.0, 1.0, 0.1).is_some());
    }

    #[test]
    fn test_same_spot_validated_once() {
        let matcher = ZoneMatcher::new(15.0, 1);
        let mut geo = GeoState::new();
        geo.activate(zone());
        matcher.update_fix(&mut geo, INSIDE);

        assert!(matcher.accept_frequency(&mut geo, 18_000.0, 1.0, 0.1).is_some());
        assert!(matcher.accept_frequency(&mut geo, 18_000.0, 1.0, 0.1).is_none());
        assert!(matcher.update_fix(&mut geo, INSIDE).is_none());
        assert!(matcher.accept_frequency(&mut geo, 18_200.0, 1.0, 0.1).is_some());
        assert!(matcher.accept_frequency(&mut geo, 18_000.0, 1.0, 0.1).is_some());
    }

    #[test]
    fn test_quiet_windows_ignored() {
        let matcher = ZoneMatcher::new(15.0, 2);
        let mut geo = GeoState::new();
        geo.activate(zone());
        matcher.set_high_accuracy(&mut geo, true);

        matcher.accept_frequency(&mut geo, 18_000.0, 1.0, 0.5);
        assert!(matcher.accept_frequency(&mut geo, 18_000.0, 0.2, 0.5).is_none());
        assert!(matcher.accept_frequency(&mut geo, 18_000.0, 1.0, 0.5).is_some());
    }
}

use super::{MoleculeConstraint, SyncState, molecule_constraint_boilerplate, molecule_constraint_impl};
use crate::core::models::delta::Delta;
use crate::core::models::group::MoleculeGroup;
use crate::core::models::ids::{MGNum, MolNum, Version};
use crate::core::models::molecule::{Molecule, Molecules};
use crate::core::models::property::PropertyMap;
use crate::core::models::system::{SPACE_PROPERTY, System, SystemError};
use crate::core::point::PointRef;
use crate::core::space::Space;
use crate::engine::constraint::ConstraintState;
use crate::engine::error::ConstraintError;
use nalgebra::{Point3, Vector3};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, trace};

/// Default number of extra candidates ranked per identity point.
pub const DEFAULT_NBUFFER: usize = 1;

/// How far a molecule is from an identity point.
///
/// Prices are totally ordered by distance, then by the x, y and z components
/// of the displacement, then by molecule number and finally by group number,
/// so every molecule has a strict, reproducible rank even at exact ties.
#[derive(Debug, Clone, Copy)]
pub struct IdentityPrice {
    pub distance: f64,
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
    pub molnum: MolNum,
    pub mgnum: MGNum,
}

impl IdentityPrice {
    pub fn new(delta: &Vector3<f64>, molnum: MolNum, mgnum: MGNum) -> Self {
        Self {
            distance: delta.norm(),
            dx: delta.x,
            dy: delta.y,
            dz: delta.z,
            molnum,
            mgnum,
        }
    }
}

impl Ord for IdentityPrice {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.dx.total_cmp(&other.dx))
            .then_with(|| self.dy.total_cmp(&other.dy))
            .then_with(|| self.dz.total_cmp(&other.dz))
            .then_with(|| self.molnum.cmp(&other.molnum))
            .then_with(|| self.mgnum.cmp(&other.mgnum))
    }
}

impl PartialOrd for IdentityPrice {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IdentityPrice {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IdentityPrice {}

/// The best-ranked molecules for one identity point.
#[derive(Debug, Clone, Default)]
struct PriceTable {
    ranked: BTreeSet<IdentityPrice>,
    by_molecule: BTreeMap<MolNum, IdentityPrice>,
}

impl PriceTable {
    fn clear(&mut self) {
        self.ranked.clear();
        self.by_molecule.clear();
    }

    fn insert(&mut self, price: IdentityPrice, capacity: usize) {
        if let Some(old) = self.by_molecule.insert(price.molnum, price) {
            self.ranked.remove(&old);
        }
        self.ranked.insert(price);
        while self.ranked.len() > capacity {
            if let Some(worst) = self.ranked.pop_last() {
                self.by_molecule.remove(&worst.molnum);
            }
        }
    }

    fn remove(&mut self, molnum: MolNum) -> Option<IdentityPrice> {
        let old = self.by_molecule.remove(&molnum)?;
        self.ranked.remove(&old);
        Some(old)
    }

    fn worst(&self) -> Option<&IdentityPrice> {
        self.ranked.last()
    }

    fn len(&self) -> usize {
        self.ranked.len()
    }
}

/// Keeps the molecule nearest to identity point `i` in identity slot `i`.
///
/// The slots are the first `n` molecules of the group by molecule number,
/// where `n` is the number of points. Molecules keep their numbers; what
/// moves between them are coordinates, so that after the constraint is
/// applied slot `i` holds the coordinates of the molecule assigned to point
/// `i`. All molecules of the group must have the same number of atoms.
#[derive(Debug, Clone)]
pub struct IdentityConstraint {
    points: Vec<PointRef>,
    mgnum: MGNum,
    map: PropertyMap,
    nbuffer: usize,

    sync: SyncState,
    space: Space,
    positions: Vec<Point3<f64>>,
    tables: Vec<PriceTable>,
    versions: BTreeMap<MolNum, Version>,
    slots: Vec<MolNum>,
    state: ConstraintState,
}

impl IdentityConstraint {
    pub fn new(points: Vec<PointRef>, mgnum: MGNum) -> Self {
        Self::with_map(points, mgnum, PropertyMap::new())
    }

    /// Reads the space through `map` (key `space`).
    pub fn with_map(points: Vec<PointRef>, mgnum: MGNum, map: PropertyMap) -> Self {
        let n = points.len();
        Self {
            points,
            mgnum,
            map,
            nbuffer: DEFAULT_NBUFFER,
            sync: SyncState::default(),
            space: Space::default(),
            positions: Vec::with_capacity(n),
            tables: vec![PriceTable::default(); n],
            versions: BTreeMap::new(),
            slots: Vec::with_capacity(n),
            state: ConstraintState::default(),
        }
    }

    pub fn with_nbuffer(mut self, nbuffer: usize) -> Self {
        self.nbuffer = nbuffer;
        self.sync.clear();
        self
    }

    pub fn points(&self) -> &[PointRef] {
        &self.points
    }

    pub fn nbuffer(&self) -> usize {
        self.nbuffer
    }

    /// The molecules holding the identity slots, in point order.
    pub fn slots(&self) -> &[MolNum] {
        &self.slots
    }

    /// The ranked candidates of identity point `i`, best first.
    pub fn prices(&self, i: usize) -> impl Iterator<Item = &IdentityPrice> {
        self.tables.get(i).into_iter().flat_map(|t| t.ranked.iter())
    }

    fn capacity(&self) -> usize {
        self.points.len() + self.nbuffer
    }

    fn space_property(&self) -> &str {
        self.map.get(SPACE_PROPERTY)
    }

    fn price(&self, i: usize, molecule: &Molecule) -> IdentityPrice {
        let delta = self
            .space
            .min_image_delta(&self.positions[i], &molecule.center());
        IdentityPrice::new(&delta, molecule.number(), self.mgnum)
    }

    fn validate(&self, group: &MoleculeGroup) -> Result<(), ConstraintError> {
        let n = self.points.len();
        if group.n_molecules() < n {
            return Err(ConstraintError::Incompatible(format!(
                "identity constraint has {} points but {} only holds {} molecules",
                n,
                group.number(),
                group.n_molecules()
            )));
        }
        let mut atoms = group.molecules().iter().map(Molecule::n_atoms);
        if let Some(first) = atoms.next() {
            if atoms.any(|count| count != first) {
                return Err(ConstraintError::Incompatible(format!(
                    "molecules of {} must all have the same number of atoms to swap identities",
                    group.number()
                )));
            }
        }
        Ok(())
    }

    /// Rebuilds the ranked table of point `i` from every molecule of the group.
    pub fn recalculate_point_prices(&mut self, i: usize, group: &MoleculeGroup) {
        if i >= self.positions.len() {
            return;
        }
        let capacity = self.capacity();
        let prices: Vec<IdentityPrice> = group
            .molecules()
            .iter()
            .map(|molecule| self.price(i, molecule))
            .collect();
        let table = &mut self.tables[i];
        table.clear();
        for price in prices {
            table.insert(price, capacity);
        }
    }

    /// Updates every table for molecules that moved, skipping points in `recalculated`.
    ///
    /// A molecule that drops out of contention could let an unranked molecule
    /// in, which a table cannot know about; that point is then rebuilt.
    pub fn recalculate_molecule_prices(
        &mut self,
        moved: &[&Molecule],
        group: &MoleculeGroup,
        recalculated: &BTreeSet<usize>,
    ) {
        let capacity = self.capacity();
        for i in 0..self.positions.len() {
            if recalculated.contains(&i) {
                continue;
            }
            let mut rebuild = false;
            for molecule in moved {
                let new = self.price(i, molecule);
                let table = &mut self.tables[i];
                match table.remove(molecule.number()) {
                    None => {
                        if table.len() < capacity || table.worst().is_some_and(|w| new < *w) {
                            table.insert(new, capacity);
                        }
                    }
                    Some(old) => {
                        let all_ranked = table.len() + 1 >= group.n_molecules();
                        let still_ahead = table.worst().is_some_and(|w| new < *w);
                        if new <= old || still_ahead || all_ranked {
                            table.insert(new, capacity);
                        } else {
                            rebuild = true;
                            break;
                        }
                    }
                }
            }
            if rebuild {
                trace!(point = i, "Rebuilding identity prices");
                self.recalculate_point_prices(i, group);
            }
        }
    }

    fn rebuild(&mut self, system: &System, group: &MoleculeGroup) -> Result<(), ConstraintError> {
        self.validate(group)?;
        self.space = system.space_named(self.space_property());
        self.positions = self
            .points
            .iter()
            .map(|p| p.position(system))
            .collect::<Result<_, _>>()?;
        self.slots = group.molecules().numbers().take(self.points.len()).collect();
        self.tables = vec![PriceTable::default(); self.points.len()];
        for i in 0..self.points.len() {
            self.recalculate_point_prices(i, group);
        }
        self.versions = group
            .molecules()
            .iter()
            .map(|m| (m.number(), m.version()))
            .collect();
        debug!(group = %self.mgnum, points = self.points.len(), "Ranked identity candidates");
        Ok(())
    }

    /// Brings the tables up to date with molecules that moved since the last sync.
    fn refresh(
        &mut self,
        system: &System,
        group: &MoleculeGroup,
        hint: Option<&BTreeSet<MolNum>>,
    ) -> Result<(), ConstraintError> {
        self.validate(group)?;
        let moved: Vec<&Molecule> = group
            .molecules()
            .iter()
            .filter(|m| hint.is_none_or(|h| h.contains(&m.number())))
            .filter(|m| self.versions.get(&m.number()) != Some(&m.version()))
            .collect();
        if moved.is_empty() {
            return Ok(());
        }
        let moved_numbers: BTreeSet<MolNum> = moved.iter().map(|m| m.number()).collect();

        let mut recalculated = BTreeSet::new();
        for (i, point) in self.points.iter().enumerate() {
            if point.molecule().is_some_and(|m| moved_numbers.contains(&m)) {
                recalculated.insert(i);
            }
        }
        for &i in &recalculated {
            self.positions[i] = self.points[i].position(system)?;
            self.recalculate_point_prices(i, group);
        }
        self.recalculate_molecule_prices(&moved, group, &recalculated);
        for molecule in moved {
            self.versions.insert(molecule.number(), molecule.version());
        }
        Ok(())
    }

    /// Assigns one molecule to each point, cheapest candidates first.
    fn assignment(&self) -> Result<Vec<MolNum>, ConstraintError> {
        let mut candidates: Vec<(&IdentityPrice, usize)> = self
            .tables
            .iter()
            .enumerate()
            .flat_map(|(i, table)| table.ranked.iter().map(move |price| (price, i)))
            .collect();
        candidates.sort();

        let mut assigned: Vec<Option<MolNum>> = vec![None; self.points.len()];
        let mut used = BTreeSet::new();
        for (price, i) in candidates {
            if assigned[i].is_none() && !used.contains(&price.molnum) {
                assigned[i] = Some(price.molnum);
                used.insert(price.molnum);
            }
        }
        assigned
            .into_iter()
            .enumerate()
            .map(|(i, m)| {
                m.ok_or_else(|| {
                    ConstraintError::Incompatible(format!(
                        "no molecule could be assigned to identity point {}",
                        i
                    ))
                })
            })
            .collect()
    }

    /// Coordinate swaps that put each assigned molecule's coordinates in its slot.
    fn swaps(&self, group: &MoleculeGroup, assigned: &[MolNum]) -> Result<Molecules, ConstraintError> {
        let coordinates = |molnum: MolNum| -> Result<Vec<Point3<f64>>, ConstraintError> {
            group
                .molecule(molnum)
                .map(|m| m.coordinates().to_vec())
                .ok_or_else(|| SystemError::MissingMolecule(molnum).into())
        };

        let mut targets: BTreeMap<MolNum, MolNum> = self
            .slots
            .iter()
            .copied()
            .zip(assigned.iter().copied())
            .collect();
        let slots: BTreeSet<MolNum> = self.slots.iter().copied().collect();
        let chosen: BTreeSet<MolNum> = assigned.iter().copied().collect();
        let displaced = chosen.difference(&slots).copied();
        let freed = slots.difference(&chosen).copied();
        targets.extend(displaced.zip(freed));

        let mut changes = Molecules::new();
        for (molnum, source) in targets {
            if molnum == source {
                continue;
            }
            let Some(molecule) = group.molecule(molnum) else {
                continue;
            };
            let mut swapped = molecule.clone();
            if swapped.set_coordinates(coordinates(source)?) {
                changes.insert(swapped);
            }
        }
        Ok(changes)
    }

    fn identify(
        &mut self,
        system: &System,
        hint: Option<&BTreeSet<MolNum>>,
    ) -> Result<Molecules, ConstraintError> {
        let group = system.group(self.mgnum)?;
        let space = system.space_named(self.space_property());
        if self.sync.structure_changed(system) || space != self.space {
            self.rebuild(system, group)?;
        } else {
            self.refresh(system, group, hint)?;
        }
        let assigned = self.assignment()?;
        let changes = self.swaps(group, &assigned)?;
        self.sync.sync(system);
        Ok(changes)
    }

    fn affected_by(&self, delta: &Delta) -> bool {
        delta.involves_property(self.space_property())
            || self.versions.keys().any(|m| delta.involves_molecule(*m))
            || self
                .points
                .iter()
                .filter_map(PointRef::molecule)
                .any(|m| delta.involves_molecule(m))
    }
}

impl PartialEq for IdentityConstraint {
    fn eq(&self, other: &Self) -> bool {
        self.points == other.points
            && self.mgnum == other.mgnum
            && self.map == other.map
            && self.nbuffer == other.nbuffer
    }
}

molecule_constraint_impl!(IdentityConstraint, "identity");

impl MoleculeConstraint for IdentityConstraint {
    molecule_constraint_boilerplate!();

    fn update(&mut self, system: &System) -> Result<Molecules, ConstraintError> {
        self.identify(system, None)
    }

    fn update_for_molecule(
        &mut self,
        system: &System,
        molnum: MolNum,
    ) -> Result<Molecules, ConstraintError> {
        self.identify(system, Some(&BTreeSet::from([molnum])))
    }

    fn update_for_molecules(
        &mut self,
        system: &System,
        molecules: &Molecules,
    ) -> Result<Molecules, ConstraintError> {
        let hint: BTreeSet<MolNum> = molecules.numbers().collect();
        self.identify(system, Some(&hint))
    }
}

impl fmt::Display for IdentityConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IdentityConstraint( {} points in {} )",
            self.points.len(),
            self.mgnum
        )
    }
}

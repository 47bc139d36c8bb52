//! Knowledge pack registry.
//!
//! A knowledge pack bundles everything the Context Builder and Narrative
//! Generator need to know about one pathology: the keyword dictionary used
//! for pathology-detection scoring, expected fields, grading scales, common
//! procedures/complications, follow-up conventions, canonical spelling
//! normalization, and a narrative template hint. Packs are data, not code:
//! adding a pathology means adding a pack file under `packs_dir`, not
//! touching this module.

use crate::error::{PipelineError, Result};
use crate::types::{KnowledgePack, Pathology};
use std::collections::HashMap;
use std::path::Path;

/// In-memory registry of knowledge packs, keyed by [`Pathology`]. Built once
/// at startup from the built-in defaults, optionally overlaid with packs
/// loaded from disk.
#[derive(Debug, Clone)]
pub struct KnowledgeRegistry {
    packs: HashMap<Pathology, KnowledgePack>,
}

impl KnowledgeRegistry {
    /// Build the registry from the built-in default packs, one per
    /// pathology tag.
    pub fn with_defaults() -> Self {
        let mut packs = HashMap::new();
        for pathology in Pathology::all() {
            packs.insert(*pathology, default_pack(*pathology));
        }
        Self { packs }
    }

    /// Overlay packs loaded from JSON files under `dir`, one file per
    /// pathology named `<tag>.json` (e.g. `sah.json`). Missing files are
    /// skipped; existing defaults remain in place for them.
    pub fn load_overlays(&mut self, dir: &Path) -> Result<()> {
        for pathology in Pathology::all() {
            let path = dir.join(format!("{}.json", pathology.as_str().to_lowercase()));
            if !path.exists() {
                continue;
            }
            let contents = std::fs::read_to_string(&path)?;
            let pack: KnowledgePack = serde_json::from_str(&contents)?;
            self.packs.insert(*pathology, pack);
        }
        Ok(())
    }

    pub fn get(&self, pathology: Pathology) -> &KnowledgePack {
        self.packs
            .get(&pathology)
            .unwrap_or_else(|| self.packs.get(&Pathology::General).expect("general pack always present"))
    }

    pub fn try_get(&self, pathology: Pathology) -> Result<&KnowledgePack> {
        self.packs
            .get(&pathology)
            .ok_or_else(|| PipelineError::KnowledgePackNotFound(format!("{pathology}").into()))
    }

    pub fn all(&self) -> impl Iterator<Item = &KnowledgePack> {
        self.packs.values()
    }
}

impl Default for KnowledgeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn default_pack(pathology: Pathology) -> KnowledgePack {
    let mut canonical_spellings = HashMap::new();
    canonical_spellings.insert("evd".to_string(), "external ventricular drain".to_string());
    canonical_spellings.insert("vps".to_string(), "ventriculoperitoneal shunt".to_string());
    canonical_spellings.insert("sdh".to_string(), "subdural hematoma".to_string());
    canonical_spellings.insert("sah".to_string(), "subarachnoid hemorrhage".to_string());
    canonical_spellings.insert("csf".to_string(), "cerebrospinal fluid".to_string());
    canonical_spellings.insert("gcs".to_string(), "glasgow coma scale".to_string());

    match pathology {
        Pathology::Sah => KnowledgePack {
            name: pathology,
            aliases: vec!["subarachnoid hemorrhage".into(), "aneurysmal SAH".into()],
            keyword_weights: weights(&[
                ("subarachnoid hemorrhage", 3.0),
                ("sah", 2.5),
                ("aneurysm", 2.0),
                ("vasospasm", 2.0),
                ("coiling", 1.5),
                ("clipping", 1.5),
                ("hunt and hess", 2.0),
                ("fisher grade", 1.5),
                ("nimodipine", 1.5),
            ]),
            expected_fields: vec![
                "hunt_hess_grade".into(),
                "fisher_grade".into(),
                "aneurysm_location".into(),
                "securing_procedure".into(),
            ],
            grading_scales: scales(&[("hunt_hess", 1.0, 5.0), ("fisher", 1.0, 4.0)]),
            common_procedures: vec![
                "craniotomy for aneurysm clipping".into(),
                "endovascular coiling".into(),
                "external ventricular drain placement".into(),
            ],
            common_complications: vec![
                "vasospasm".into(),
                "rebleeding".into(),
                "hydrocephalus".into(),
                "seizure".into(),
            ],
            follow_up_conventions: vec![
                "neurosurgery clinic in 2-4 weeks with angiogram".into(),
            ],
            narrative_template: "admitted with {diagnosis} secondary to aneurysmal subarachnoid hemorrhage".into(),
            canonical_spellings,
        },
        Pathology::Tumor => KnowledgePack {
            name: pathology,
            aliases: vec!["brain tumor".into(), "intracranial neoplasm".into()],
            keyword_weights: weights(&[
                ("tumor", 2.5),
                ("glioblastoma", 2.5),
                ("meningioma", 2.0),
                ("astrocytoma", 2.0),
                ("resection", 1.5),
                ("craniotomy for tumor", 2.0),
                ("pathology", 1.0),
            ]),
            expected_fields: vec!["tumor_type".into(), "tumor_location".into(), "extent_of_resection".into()],
            grading_scales: scales(&[("who_grade", 1.0, 4.0)]),
            common_procedures: vec!["craniotomy for tumor resection".into(), "stereotactic biopsy".into()],
            common_complications: vec!["cerebral edema".into(), "seizure".into(), "wound infection".into()],
            follow_up_conventions: vec!["neuro-oncology and radiation oncology within 2 weeks".into()],
            narrative_template: "admitted for surgical management of {diagnosis}".into(),
            canonical_spellings: HashMap::new(),
        },
        Pathology::Spine => KnowledgePack {
            name: pathology,
            aliases: vec!["spinal pathology".into()],
            keyword_weights: weights(&[
                ("laminectomy", 2.0),
                ("discectomy", 2.0),
                ("fusion", 2.0),
                ("spinal stenosis", 2.0),
                ("radiculopathy", 1.5),
                ("myelopathy", 2.0),
            ]),
            expected_fields: vec!["spinal_level".into(), "procedure_type".into()],
            grading_scales: HashMap::new(),
            common_procedures: vec!["laminectomy".into(), "discectomy".into(), "posterior spinal fusion".into()],
            common_complications: vec!["dural tear".into(), "wound infection".into(), "hardware failure".into()],
            follow_up_conventions: vec!["spine clinic in 2 weeks with standing films".into()],
            narrative_template: "admitted for surgical management of {diagnosis}".into(),
            canonical_spellings: HashMap::new(),
        },
        Pathology::Tbi => KnowledgePack {
            name: pathology,
            aliases: vec!["traumatic brain injury".into()],
            keyword_weights: weights(&[
                ("traumatic brain injury", 2.5),
                ("tbi", 2.0),
                ("contusion", 2.0),
                ("diffuse axonal injury", 2.0),
                ("gcs", 1.5),
                ("craniectomy", 2.0),
            ]),
            expected_fields: vec!["gcs_on_admission".into(), "injury_mechanism".into()],
            grading_scales: scales(&[("gcs", 3.0, 15.0)]),
            common_procedures: vec!["decompressive craniectomy".into(), "intracranial pressure monitor placement".into()],
            common_complications: vec!["elevated intracranial pressure".into(), "seizure".into()],
            follow_up_conventions: vec!["neurosurgery and neuro-rehabilitation follow-up".into()],
            narrative_template: "admitted after traumatic brain injury".into(),
            canonical_spellings: HashMap::new(),
        },
        Pathology::Hydrocephalus => KnowledgePack {
            name: pathology,
            aliases: vec!["hydrocephalus".into()],
            keyword_weights: weights(&[
                ("hydrocephalus", 2.5),
                ("ventriculomegaly", 2.0),
                ("shunt", 2.0),
                ("evd", 1.5),
                ("third ventriculostomy", 2.0),
            ]),
            expected_fields: vec!["shunt_type".into(), "etiology".into()],
            grading_scales: HashMap::new(),
            common_procedures: vec!["ventriculoperitoneal shunt placement".into(), "endoscopic third ventriculostomy".into()],
            common_complications: vec!["shunt malfunction".into(), "shunt infection".into()],
            follow_up_conventions: vec!["neurosurgery clinic in 2 weeks with shunt series".into()],
            narrative_template: "admitted for management of {diagnosis}".into(),
            canonical_spellings: HashMap::new(),
        },
        Pathology::Csdh => KnowledgePack {
            name: pathology,
            aliases: vec!["chronic subdural hematoma".into(), "csdh".into()],
            keyword_weights: weights(&[
                ("chronic subdural hematoma", 2.5),
                ("csdh", 2.0),
                ("burr hole", 2.0),
                ("subdural", 1.5),
            ]),
            expected_fields: vec!["laterality".into(), "procedure_type".into()],
            grading_scales: HashMap::new(),
            common_procedures: vec!["burr hole evacuation".into(), "craniotomy for subdural evacuation".into()],
            common_complications: vec!["recurrence".into(), "seizure".into()],
            follow_up_conventions: vec!["neurosurgery clinic in 2-4 weeks with CT head".into()],
            narrative_template: "admitted for management of {diagnosis}".into(),
            canonical_spellings: HashMap::new(),
        },
        Pathology::CsfLeak => KnowledgePack {
            name: pathology,
            aliases: vec!["cerebrospinal fluid leak".into(), "csf leak".into()],
            keyword_weights: weights(&[
                ("csf leak", 2.5),
                ("rhinorrhea", 2.0),
                ("otorrhea", 2.0),
                ("dural repair", 2.0),
                ("lumbar drain", 1.5),
            ]),
            expected_fields: vec!["leak_site".into(), "repair_method".into()],
            grading_scales: HashMap::new(),
            common_procedures: vec!["endoscopic endonasal repair".into(), "lumbar drain placement".into()],
            common_complications: vec!["meningitis".into(), "recurrent leak".into()],
            follow_up_conventions: vec!["ENT and neurosurgery follow-up in 2 weeks".into()],
            narrative_template: "admitted for management of {diagnosis}".into(),
            canonical_spellings: HashMap::new(),
        },
        Pathology::Seizures => KnowledgePack {
            name: pathology,
            aliases: vec!["seizure disorder".into(), "epilepsy".into()],
            keyword_weights: weights(&[
                ("seizure", 2.0),
                ("status epilepticus", 2.5),
                ("eeg", 1.5),
                ("levetiracetam", 1.0),
                ("epilepsy", 2.0),
            ]),
            expected_fields: vec!["seizure_type".into(), "eeg_findings".into()],
            grading_scales: HashMap::new(),
            common_procedures: vec!["continuous eeg monitoring".into()],
            common_complications: vec!["status epilepticus".into(), "medication side effects".into()],
            follow_up_conventions: vec!["epilepsy clinic in 2-4 weeks with repeat eeg".into()],
            narrative_template: "admitted for management of {diagnosis}".into(),
            canonical_spellings: HashMap::new(),
        },
        Pathology::Metastases => KnowledgePack {
            name: pathology,
            aliases: vec!["brain metastases".into(), "metastatic brain disease".into()],
            keyword_weights: weights(&[
                ("metastasis", 2.5),
                ("metastases", 2.5),
                ("metastatic", 2.0),
                ("whole brain radiation", 1.5),
                ("stereotactic radiosurgery", 1.5),
            ]),
            expected_fields: vec!["primary_malignancy".into(), "number_of_lesions".into()],
            grading_scales: HashMap::new(),
            common_procedures: vec!["craniotomy for resection of metastasis".into(), "stereotactic radiosurgery".into()],
            common_complications: vec!["cerebral edema".into(), "seizure".into()],
            follow_up_conventions: vec!["neuro-oncology and radiation oncology follow-up".into()],
            narrative_template: "admitted for surgical management of {diagnosis}".into(),
            canonical_spellings: HashMap::new(),
        },
        Pathology::General => KnowledgePack {
            name: pathology,
            aliases: vec![],
            keyword_weights: HashMap::new(),
            expected_fields: vec![],
            grading_scales: HashMap::new(),
            common_procedures: vec![],
            common_complications: vec![],
            follow_up_conventions: vec!["follow up with neurosurgery as directed".into()],
            narrative_template: "admitted for {diagnosis}".into(),
            canonical_spellings,
        },
    }
}

fn weights(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn scales(pairs: &[(&str, f64, f64)]) -> HashMap<String, (f64, f64)> {
    pairs.iter().map(|(k, lo, hi)| (k.to_string(), (*lo, *hi))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_covers_every_pathology() {
        let registry = KnowledgeRegistry::with_defaults();
        for pathology in Pathology::all() {
            assert!(registry.try_get(*pathology).is_ok());
        }
    }

    #[test]
    fn sah_pack_has_expected_keywords() {
        let registry = KnowledgeRegistry::with_defaults();
        let pack = registry.get(Pathology::Sah);
        assert!(pack.keyword_weights.contains_key("subarachnoid hemorrhage"));
        assert!(pack.canonical_spellings.contains_key("evd"));
    }

    #[test]
    fn get_falls_back_to_general_for_missing_entry() {
        let mut registry = KnowledgeRegistry::with_defaults();
        registry.packs.remove(&Pathology::Tumor);
        let pack = registry.get(Pathology::Tumor);
        assert_eq!(pack.name, Pathology::General);
    }
}

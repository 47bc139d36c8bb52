//! Sample clinical note fixtures shared across integration tests.

use dcs_pipeline::Note;

pub fn minimal_sah_case() -> Vec<Note> {
    vec![Note::new(
        "62yo male, SAH, underwent endovascular coiling 10/12/2024, discharged home 10/22/2024.\n\
         Admission Date: 10/12/2024\n\
         Surgery Date: 10/12/2024\n\
         Discharge Date: 10/22/2024\n\
         Procedure: Endovascular coiling of ruptured aneurysm\n\
         Discharge medications: Nimodipine 60 mg PO Q4H\n",
    )]
}

pub fn pod_reference_case() -> Vec<Note> {
    vec![Note::new(
        "Admission Date: 10/11/2024\n\
         Surgery Date: 10/11/2024\n\
         Discharge Date: 10/20/2024\n\
         Patient underwent craniotomy for aneurysm clipping on surgery 10/11/2024.\n\
         POD#3 developed vasospasm, treated with nimodipine 60 mg PO Q4H.\n",
    )]
}

pub fn duplication_collapse_case() -> Vec<Note> {
    (0..5)
        .map(|_| Note::new("Procedure: craniotomy for aneurysm clipping\n"))
        .collect()
}

pub fn reference_vs_new_event_case() -> Vec<Note> {
    vec![
        Note::new("Admission Date: 10/01/2024\nProcedure: underwent coiling 10/12\n"),
        Note::new("s/p coiling, doing well.\n"),
        Note::new("s/p coiling, neurologically intact.\n"),
        Note::new("s/p coiling, discharge planning underway.\n"),
    ]
}

/// Scenario 6: complex multi-pathology case. Primary pathology is spine
/// (fusion/laminectomy keywords dominate); the stay is complicated by a
/// pulmonary embolism treated with anticoagulation, a wound infection
/// treated with vancomycin, and a documented history of depression.
pub fn complex_multi_pathology_case() -> Vec<Note> {
    vec![Note::new(
        "55yo female with lumbar spinal stenosis and radiculopathy, history of depression.\n\
         Admission Date: 01/05/2024\n\
         Surgery Date: 01/06/2024\n\
         Discharge Date: 01/16/2024\n\
         Procedure: Posterior lumbar laminectomy and fusion L4-L5\n\
         POD#2 developed pulmonary embolism, started on therapeutic anticoagulation.\n\
         POD#6 wound infection at the surgical site, cultures grew MRSA.\n\
         Discharge medications: Enoxaparin 1 mg/kg SC BID, Vancomycin 1 g IV Q12H\n",
    )]
}
